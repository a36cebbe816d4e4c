//! Outbound reply delivery.
//!
//! Sending is never on the webhook's critical path. A dispatcher hands the
//! job to a spawned task or to the durable queue, and [`deliver`] performs the
//! send and records its outcome in the audit log.

pub mod dispatch;
pub mod mailgun;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::queue::OutboundJob;
use crate::store::{truncate_preview, AuditLog, Direction, EmailLogEntry, EmailStatus};

pub use dispatch::{DispatchError, InlineDispatcher, OutboundDispatcher, QueueDispatcher};
pub use mailgun::MailgunSender;

#[cfg(test)]
pub use dispatch::MockOutboundDispatcher;

/// Provider receipt for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub delivery_id: String,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("outbound email is not configured")]
    NotConfigured,

    #[error("send request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("send timed out after {0} ms")]
    Timeout(u64),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider accepted the message (status {status}) without a delivery id")]
    MissingDeliveryId { status: u16 },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, job: &OutboundJob) -> Result<SentMessage, SendError>;
}

/// Audit entry for the outcome of sending `job`.
pub fn outbound_entry(
    job: &OutboundJob,
    status: EmailStatus,
    delivery_id: Option<String>,
    error: Option<String>,
    preview_max_chars: usize,
) -> EmailLogEntry {
    EmailLogEntry {
        tenant_id: job.tenant_id.clone(),
        timestamp: Utc::now(),
        direction: Direction::Outbound,
        from: job.from.clone(),
        to: job.to.clone(),
        subject: job.subject.clone(),
        status,
        reply_preview: truncate_preview(&job.text, preview_max_chars),
        message_id: job.in_reply_to.clone(),
        delivery_id,
        usage_count: None,
        usage_quota: None,
        ai_tokens_used: None,
        cost_usd: None,
        error,
    }
}

/// Send `job` and record the outcome. Failures are recorded, not retried.
pub async fn deliver(
    sender: &dyn OutboundSender,
    audit: &dyn AuditLog,
    job: &OutboundJob,
    preview_max_chars: usize,
) -> Result<SentMessage, SendError> {
    let result = sender.send(job).await;

    let entry = match &result {
        Ok(sent) => {
            info!(
                tenant_id = %job.tenant_id,
                to = %job.to,
                delivery_id = %sent.delivery_id,
                "outbound_sent"
            );
            outbound_entry(
                job,
                EmailStatus::Sent,
                Some(sent.delivery_id.clone()),
                None,
                preview_max_chars,
            )
        }
        Err(e) => {
            error!(
                tenant_id = %job.tenant_id,
                to = %job.to,
                error = %e,
                "outbound_send_failed"
            );
            outbound_entry(
                job,
                EmailStatus::Failed,
                None,
                Some(e.to_string()),
                preview_max_chars,
            )
        }
    };

    if let Err(e) = audit.record(&entry).await {
        warn!(
            tenant_id = %job.tenant_id,
            status = %entry.status,
            error = %e,
            "audit_log_write_failed"
        );
    }

    result
}

/// [`deliver`] over shared handles, for spawned tasks.
pub async fn deliver_shared(
    sender: Arc<dyn OutboundSender>,
    audit: Arc<dyn AuditLog>,
    job: OutboundJob,
    preview_max_chars: usize,
) -> Result<SentMessage, SendError> {
    deliver(sender.as_ref(), audit.as_ref(), &job, preview_max_chars).await
}
