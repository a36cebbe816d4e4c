//! Reply generation.
//!
//! A generator turns an inbound message and the tenant's preferences into
//! reply text. Generators never persist anything, so a call can be retried
//! freely.

pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

use crate::inbound::InboundEmail;
use crate::store::TenantSettings;

pub use openai::OpenAiGenerator;

/// Fixed instruction sent as the system message.
pub const SYSTEM_PROMPT: &str = "You write email replies.";

/// Tone and signature applied to generated replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPreferences {
    pub tone: String,
    pub signature: String,
}

impl Default for ReplyPreferences {
    fn default() -> Self {
        Self {
            tone: "professional".to_string(),
            signature: String::new(),
        }
    }
}

impl From<&TenantSettings> for ReplyPreferences {
    fn from(settings: &TenantSettings) -> Self {
        Self {
            tone: settings.tone.clone(),
            signature: settings.signature.clone(),
        }
    }
}

/// Text produced by a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReply {
    pub text: String,
    /// Total tokens billed by the model provider, when reported
    pub tokens_used: Option<i64>,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no model API key configured")]
    NotConfigured,

    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned no content")]
    EmptyResponse,

    #[error("generation timed out after {0} ms")]
    Timeout(u64),

    #[error("generation task failed: {0}")]
    TaskFailed(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        email: &InboundEmail,
        prefs: &ReplyPreferences,
    ) -> Result<GeneratedReply, GenerationError>;
}

/// Build the user prompt for a message.
pub fn build_prompt(email: &InboundEmail, prefs: &ReplyPreferences) -> String {
    let mut prompt = format!(
        "You are ReplyMint, an assistant that drafts concise, helpful email replies in a {} tone.\n\
         Original email from {}:\nSubject: {}\n\n{}\n\n\
         Write a reply that is polite, clear, and actionable.",
        prefs.tone, email.from, email.subject, email.body
    );

    if !prefs.signature.trim().is_empty() {
        prompt.push_str("\n\nEnd the reply with this signature, if appropriate:\n");
        prompt.push_str(&prefs.signature);
    }

    prompt
}
