//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{build_prompt, GeneratedReply, GenerationError, ReplyGenerator, ReplyPreferences, SYSTEM_PROMPT};
use crate::inbound::InboundEmail;
use crate::Config;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: i64,
}

/// Generator backed by a chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiGenerator {
    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            api_base: config.openai_api_base.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            max_tokens: config.ai_max_tokens,
            temperature: config.ai_temperature,
            timeout: Duration::from_millis(config.ai_timeout_ms),
        })
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        email: &InboundEmail,
        prefs: &ReplyPreferences,
    ) -> Result<GeneratedReply, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::NotConfigured)?;

        let prompt = build_prompt(email, prefs);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        info!(
            model = %self.model,
            max_tokens = self.max_tokens,
            prompt_length = prompt.len(),
            "ai_generation_starting"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(timeout_ms = self.timeout.as_millis() as u64, "ai_generation_timeout");
                    GenerationError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    error!(error = %e, "ai_generation_request_error");
                    GenerationError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status_code = status.as_u16(), "ai_generation_bad_status");
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse = response.json().await?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(GenerationError::EmptyResponse)?;

        let tokens_used = parsed.usage.map(|u| u.total_tokens);

        info!(
            reply_length = text.len(),
            tokens_used = ?tokens_used,
            "ai_generation_complete"
        );

        Ok(GeneratedReply { text, tokens_used })
    }
}
