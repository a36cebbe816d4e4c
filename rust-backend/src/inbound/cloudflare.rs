//! Cloudflare Email Worker payloads.
//!
//! The worker forwards the raw RFC 5322 message, which is parsed here.

use serde::Deserialize;
use tracing::warn;

use super::email_parser::parse_raw_email;
use super::InboundEmail;

/// Cloudflare JSON payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudflarePayload {
    #[serde(rename = "from")]
    pub from_field: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub raw_content: String,
}

impl CloudflarePayload {
    /// Build the inbound message. An unparseable body degrades to an empty
    /// one rather than dropping the message.
    pub fn into_email(self) -> InboundEmail {
        let parsed = match parse_raw_email(&self.raw_content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    to = %self.to,
                    error = %e,
                    raw_content_length = self.raw_content.len(),
                    "cloudflare_raw_parse_failed"
                );
                Default::default()
            }
        };

        let subject = if self.subject.trim().is_empty() {
            parsed.subject.unwrap_or_default()
        } else {
            self.subject
        };

        InboundEmail {
            from: self.from_field,
            to: self.to,
            subject,
            body: parsed.body.unwrap_or_default(),
            message_id: parsed.message_id,
        }
    }
}
