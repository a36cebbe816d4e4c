//! Queue message types.
//!
//! The `outbound_replies` queue carries generated replies from the web server
//! to the sender worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue name for generated replies awaiting delivery.
pub const OUTBOUND_QUEUE: &str = "outbound_replies";

/// A generated reply ready to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundJob {
    /// Tenant that owns the reply; its audit log receives the send outcome
    pub tenant_id: String,
    /// Original sender
    pub to: String,
    /// Tenant address the original message was sent to
    pub from: String,
    pub subject: String,
    pub text: String,
    /// Message-Id of the message being answered
    #[serde(default)]
    pub in_reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboundJob {
    /// Create a reply job. The subject gets a `Re: ` prefix unless it
    /// already has one.
    pub fn reply(
        tenant_id: String,
        to: String,
        from: String,
        original_subject: &str,
        text: String,
        in_reply_to: Option<String>,
    ) -> Self {
        Self {
            tenant_id,
            to,
            from,
            subject: reply_subject(original_subject),
            text,
            in_reply_to,
            created_at: Utc::now(),
        }
    }

    /// Identifier used as the AMQP message id.
    pub fn message_id(&self) -> String {
        match &self.in_reply_to {
            Some(id) => format!("reply-{}", id),
            None => format!("reply-{}-{}", self.tenant_id, self.created_at.timestamp_micros()),
        }
    }
}

/// `Re: <subject>` unless the subject already starts with `re:` in any case.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    let already_reply = trimmed
        .get(..3)
        .map(|prefix| prefix.eq_ignore_ascii_case("re:"))
        .unwrap_or(false);

    if already_reply {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}
