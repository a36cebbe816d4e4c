//! ReplyMint Sender - drains the outbound reply queue.
//!
//! The web server publishes generated replies to `outbound_replies` when a
//! broker is configured. This worker sends them through Mailgun and records
//! each outcome in the audit log.

mod consumer;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use replymint::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("sender_starting");

    let config = Config::from_env();
    let url = config
        .cloudamqp_url
        .clone()
        .context("CLOUDAMQP_URL must be set for the sender worker")?;

    tracing::info!(
        environment = %config.environment,
        concurrency = config.worker_concurrency,
        mailgun_configured = config.mailgun_api_key.is_some() && config.mailgun_domain_outbound.is_some(),
        "config_loaded"
    );

    consumer::run(config, &url).await
}
