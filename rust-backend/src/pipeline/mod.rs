//! Inbound email pipeline.
//!
//! One call to [`EmailPipeline::handle`] takes a message through
//! claim → quota → generation → audit → outbound dispatch and returns a
//! single [`ReplyOutcome`].
//!
//! Store failures before the quota decision abort the run with
//! [`PipelineError::StoreUnavailable`] and release the delivery claim so a
//! retried webhook is processed. Every failure after admission degrades the
//! outcome instead of failing it, and the consumed quota unit is kept.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::inbound::InboundEmail;
use crate::outbound::{outbound_entry, OutboundDispatcher};
use crate::queue::OutboundJob;
use crate::quota::{QuotaGate, Reservation};
use crate::reply::{GeneratedReply, GenerationError, ReplyGenerator, ReplyPreferences};
use crate::store::{
    tenant_key, truncate_preview, AuditLog, DeliveryLedger, Direction, EmailLogEntry,
    EmailStatus, SettingsStore, SqliteStore, StoreError,
};
use crate::Config;

/// Reply text used when generation fails after admission.
pub const FALLBACK_REPLY: &str =
    "AI is currently unavailable, so no automatic reply was generated.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Generated,
    QuotaExceeded,
    AiUnavailable,
    /// The Message-Id was already processed for this tenant
    Duplicate,
}

impl ReplyStatus {
    fn email_status(&self) -> Option<EmailStatus> {
        match self {
            ReplyStatus::Generated => Some(EmailStatus::Generated),
            ReplyStatus::QuotaExceeded => Some(EmailStatus::QuotaExceeded),
            ReplyStatus::AiUnavailable => Some(EmailStatus::AiUnavailable),
            ReplyStatus::Duplicate => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    Queued,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub count: i64,
    pub quota: i64,
}

impl From<Reservation> for UsageSnapshot {
    fn from(r: Reservation) -> Self {
        Self {
            count: r.usage,
            quota: r.quota,
        }
    }
}

/// Result of one pipeline run, returned to the webhook caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyOutcome {
    pub tenant_id: String,
    pub status: ReplyStatus,
    /// Full reply text; only the preview leaves the process
    #[serde(skip)]
    pub reply: String,
    pub reply_preview: String,
    pub usage: UsageSnapshot,
    pub outbound_status: Option<OutboundStatus>,
    pub duplicate: bool,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Tunables taken from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub ai_timeout: Duration,
    pub preview_max_chars: usize,
    pub ai_cost_per_1k_tokens: f64,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ai_timeout: Duration::from_millis(config.ai_timeout_ms),
            preview_max_chars: config.preview_max_chars,
            ai_cost_per_1k_tokens: config.ai_cost_per_1k_tokens,
        }
    }
}

pub struct EmailPipeline {
    quota: QuotaGate,
    settings: Arc<dyn SettingsStore>,
    audit: Arc<dyn AuditLog>,
    ledger: Arc<dyn DeliveryLedger>,
    generator: Arc<dyn ReplyGenerator>,
    dispatcher: Arc<dyn OutboundDispatcher>,
    options: PipelineOptions,
}

impl EmailPipeline {
    pub fn new(
        quota: QuotaGate,
        settings: Arc<dyn SettingsStore>,
        audit: Arc<dyn AuditLog>,
        ledger: Arc<dyn DeliveryLedger>,
        generator: Arc<dyn ReplyGenerator>,
        dispatcher: Arc<dyn OutboundDispatcher>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            quota,
            settings,
            audit,
            ledger,
            generator,
            dispatcher,
            options,
        }
    }

    /// Wire every store seam to one SQLite store.
    pub fn with_store(
        store: Arc<SqliteStore>,
        generator: Arc<dyn ReplyGenerator>,
        dispatcher: Arc<dyn OutboundDispatcher>,
        config: &Config,
    ) -> Self {
        Self::new(
            QuotaGate::new(store.clone(), store.clone(), config.default_monthly_quota),
            store.clone(),
            store.clone(),
            store,
            generator,
            dispatcher,
            PipelineOptions::from_config(config),
        )
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    /// Process one inbound message.
    pub async fn handle(&self, email: InboundEmail) -> Result<ReplyOutcome, PipelineError> {
        let tenant_id = tenant_key(&email.to);

        info!(
            tenant_id = %tenant_id,
            from = %email.from,
            message_id = ?email.message_id,
            body_length = email.body.len(),
            "pipeline_received"
        );

        // Received
        if let Some(message_id) = &email.message_id {
            if !self.ledger.claim(&tenant_id, message_id).await? {
                return self.duplicate(tenant_id, message_id).await;
            }
        }

        // Quota-checked
        let (prefs, reservation) = match self.admit(&tenant_id).await {
            Ok(admitted) => admitted,
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "pipeline_store_unavailable");
                self.release_claim(&tenant_id, email.message_id.as_deref()).await;
                return Err(e.into());
            }
        };

        // Generated
        let (status, reply, tokens_used) = if !reservation.admitted {
            (ReplyStatus::QuotaExceeded, String::new(), None)
        } else {
            match self.generate(&email, prefs).await {
                Ok(generated) => (ReplyStatus::Generated, generated.text, generated.tokens_used),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "ai_generation_failed");
                    (ReplyStatus::AiUnavailable, FALLBACK_REPLY.to_string(), None)
                }
            }
        };

        let reply_preview = truncate_preview(&reply, self.options.preview_max_chars);

        // Logged
        self.record_inbound(&tenant_id, &email, status, &reply_preview, reservation, tokens_used)
            .await;

        // Outbound-attempted
        let outbound_status = if status == ReplyStatus::Generated {
            Some(self.dispatch_reply(&tenant_id, &email, &reply).await)
        } else {
            None
        };

        info!(
            tenant_id = %tenant_id,
            status = ?status,
            usage = reservation.usage,
            quota = reservation.quota,
            outbound_status = ?outbound_status,
            "pipeline_complete"
        );

        Ok(ReplyOutcome {
            tenant_id,
            status,
            reply,
            reply_preview,
            usage: reservation.into(),
            outbound_status,
            duplicate: false,
        })
    }

    async fn duplicate(
        &self,
        tenant_id: String,
        message_id: &str,
    ) -> Result<ReplyOutcome, PipelineError> {
        let count = self.quota.current_usage(&tenant_id).await?;
        let quota = self.quota.quota_for(&tenant_id).await?;

        info!(
            tenant_id = %tenant_id,
            message_id = %message_id,
            usage = count,
            "pipeline_duplicate_skipped"
        );

        Ok(ReplyOutcome {
            tenant_id,
            status: ReplyStatus::Duplicate,
            reply: String::new(),
            reply_preview: String::new(),
            usage: UsageSnapshot { count, quota },
            outbound_status: None,
            duplicate: true,
        })
    }

    async fn admit(&self, tenant_id: &str) -> Result<(ReplyPreferences, Reservation), StoreError> {
        let prefs = self
            .settings
            .get_settings(tenant_id)
            .await?
            .map(|s| ReplyPreferences::from(&s))
            .unwrap_or_default();

        let reservation = self.quota.check_and_reserve(tenant_id, 1).await?;

        Ok((prefs, reservation))
    }

    async fn release_claim(&self, tenant_id: &str, message_id: Option<&str>) {
        let Some(message_id) = message_id else {
            return;
        };
        if let Err(e) = self.ledger.release(tenant_id, message_id).await {
            warn!(
                tenant_id = %tenant_id,
                message_id = %message_id,
                error = %e,
                "delivery_claim_release_failed"
            );
        }
    }

    /// Run the generator on its own task so a panic or an overrun cannot
    /// take the request down with it.
    async fn generate(
        &self,
        email: &InboundEmail,
        prefs: ReplyPreferences,
    ) -> Result<GeneratedReply, GenerationError> {
        let generator = Arc::clone(&self.generator);
        let email = email.clone();

        let task = tokio::spawn(async move { generator.generate(&email, &prefs).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.options.ai_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(GenerationError::TaskFailed(join_error.to_string())),
            Err(_) => {
                abort.abort();
                Err(GenerationError::Timeout(self.options.ai_timeout.as_millis() as u64))
            }
        }
    }

    async fn record_inbound(
        &self,
        tenant_id: &str,
        email: &InboundEmail,
        status: ReplyStatus,
        reply_preview: &str,
        reservation: Reservation,
        tokens_used: Option<i64>,
    ) {
        let Some(email_status) = status.email_status() else {
            return;
        };

        let cost_usd =
            tokens_used.map(|t| t as f64 * self.options.ai_cost_per_1k_tokens / 1000.0);

        let entry = EmailLogEntry {
            tenant_id: tenant_id.to_string(),
            timestamp: Utc::now(),
            direction: Direction::Inbound,
            from: email.from.clone(),
            to: email.to.clone(),
            subject: email.subject.clone(),
            status: email_status,
            reply_preview: reply_preview.to_string(),
            message_id: email.message_id.clone(),
            delivery_id: None,
            usage_count: Some(reservation.usage),
            usage_quota: Some(reservation.quota),
            ai_tokens_used: tokens_used,
            cost_usd,
            error: None,
        };

        if let Err(e) = self.audit.record(&entry).await {
            warn!(
                tenant_id = %tenant_id,
                status = %email_status,
                error = %e,
                "audit_log_write_failed"
            );
        }
    }

    async fn dispatch_reply(
        &self,
        tenant_id: &str,
        email: &InboundEmail,
        reply: &str,
    ) -> OutboundStatus {
        let job = OutboundJob::reply(
            tenant_id.to_string(),
            email.from.clone(),
            email.to.clone(),
            &email.subject,
            reply.to_string(),
            email.message_id.clone(),
        );

        match self.dispatcher.dispatch(job.clone()).await {
            Ok(()) => OutboundStatus::Queued,
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "outbound_dispatch_failed");

                let entry = outbound_entry(
                    &job,
                    EmailStatus::Failed,
                    None,
                    Some(e.to_string()),
                    self.options.preview_max_chars,
                );
                if let Err(e) = self.audit.record(&entry).await {
                    warn!(
                        tenant_id = %tenant_id,
                        status = %EmailStatus::Failed,
                        error = %e,
                        "audit_log_write_failed"
                    );
                }

                OutboundStatus::Failed
            }
        }
    }
}
