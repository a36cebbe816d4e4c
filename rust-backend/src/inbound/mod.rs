//! Inbound email payloads from the supported providers.
//!
//! Every provider payload is reduced to an [`InboundEmail`] before it reaches
//! the pipeline.

pub mod cloudflare;
pub mod email_parser;
pub mod mailgun;

use serde::{Deserialize, Serialize};

pub use cloudflare::CloudflarePayload;
pub use email_parser::{parse_raw_email, ParsedEmail};
pub use mailgun::{MailgunEventForm, MailgunInboundForm};

/// A received message, independent of the provider that delivered it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Sender as it appeared in the message
    pub from: String,
    /// Recipient address; determines the tenant
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-Id without angle brackets
    pub message_id: Option<String>,
}
