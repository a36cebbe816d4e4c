//! Mailgun messages API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::{OutboundSender, SendError, SentMessage};
use crate::queue::OutboundJob;
use crate::Config;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: Option<String>,
}

/// Sends replies through `POST {base}/v3/{domain}/messages`.
#[derive(Clone)]
pub struct MailgunSender {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    domain: Option<String>,
    timeout: Duration,
}

impl MailgunSender {
    pub fn from_config(config: &Config) -> Result<Self, SendError> {
        let client = Client::builder().pool_max_idle_per_host(10).build()?;

        Ok(Self {
            client,
            api_base: config.mailgun_api_base.trim_end_matches('/').to_string(),
            api_key: config.mailgun_api_key.clone(),
            domain: config.mailgun_domain_outbound.clone(),
            timeout: Duration::from_millis(config.outbound_timeout_ms),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.domain.is_some()
    }
}

#[async_trait]
impl OutboundSender for MailgunSender {
    async fn send(&self, job: &OutboundJob) -> Result<SentMessage, SendError> {
        let (api_key, domain) = match (&self.api_key, &self.domain) {
            (Some(key), Some(domain)) => (key, domain),
            _ => return Err(SendError::NotConfigured),
        };

        let mut form = vec![
            ("from", job.from.clone()),
            ("to", job.to.clone()),
            ("subject", job.subject.clone()),
            ("text", job.text.clone()),
        ];
        if let Some(id) = &job.in_reply_to {
            form.push(("h:In-Reply-To", format!("<{}>", id)));
        }

        let url = format!("{}/v3/{}/messages", self.api_base, domain);

        info!(
            tenant_id = %job.tenant_id,
            to = %job.to,
            domain = %domain,
            "outbound_send_starting"
        );

        let timeout_ms = self.timeout.as_millis() as u64;
        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(api_key))
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout(timeout_ms)
                } else {
                    SendError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: MessagesResponse = response.json().await?;

        // Accepted without an id means we cannot track the delivery.
        match parsed.id.filter(|id| !id.trim().is_empty()) {
            Some(delivery_id) => Ok(SentMessage { delivery_id }),
            None => Err(SendError::MissingDeliveryId {
                status: status.as_u16(),
            }),
        }
    }
}
