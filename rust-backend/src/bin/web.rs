//! ReplyMint Web Server - webhooks, tenant API and admin API.
//!
//! Inbound webhooks run through the email pipeline before the response is
//! written. Generated replies are handed to the outbound dispatcher: the
//! RabbitMQ queue when `CLOUDAMQP_URL` is set, otherwise a task in this
//! process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use replymint::outbound::{InlineDispatcher, MailgunSender, OutboundDispatcher, QueueDispatcher};
use replymint::pipeline::EmailPipeline;
use replymint::queue::Publisher;
use replymint::reply::OpenAiGenerator;
use replymint::store::SqliteStore;
use replymint::web::{router, AppState};
use replymint::Config;

/// Whichever dispatcher was started, kept for shutdown.
enum Outbound {
    Queue(Publisher),
    Inline(InlineDispatcher),
}

impl Outbound {
    async fn close(&self) {
        match self {
            Outbound::Queue(publisher) => publisher.close().await,
            Outbound::Inline(dispatcher) => dispatcher.close().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        environment = %config.environment,
        strict_signature_check = config.strict_signature_check,
        cloudflare_auth_configured = config.cloudflare_auth_token.is_some(),
        mailgun_signing_configured = config.mailgun_signing_key.is_some(),
        stripe_signing_configured = config.stripe_webhook_secret.is_some(),
        openai_configured = config.openai_api_key.is_some(),
        jwt_configured = config.jwt_secret.is_some(),
        queue_configured = config.cloudamqp_url.is_some(),
        mailgun_domain = ?config.mailgun_domain,
        "config_loaded"
    );

    let store = SqliteStore::open(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to open database")?;
    let store = Arc::new(store);
    info!("database_ready");

    let generator =
        OpenAiGenerator::from_config(&config).context("Failed to create OpenAI client")?;

    let (dispatcher, outbound): (Arc<dyn OutboundDispatcher>, Outbound) =
        match &config.cloudamqp_url {
            Some(url) => {
                let publisher = Publisher::new(url.clone());
                info!("rabbitmq_publisher_created");
                (
                    Arc::new(QueueDispatcher::new(publisher.clone())),
                    Outbound::Queue(publisher),
                )
            }
            None => {
                let sender = MailgunSender::from_config(&config)
                    .context("Failed to create Mailgun client")?;
                if !sender.is_configured() {
                    warn!("mailgun_not_configured_sends_will_fail");
                }
                let inline = InlineDispatcher::new(
                    Arc::new(sender),
                    store.clone(),
                    config.worker_concurrency,
                    config.preview_max_chars,
                );
                info!("inline_dispatcher_created");
                (Arc::new(inline.clone()), Outbound::Inline(inline))
            }
        };

    let pipeline = EmailPipeline::with_store(store.clone(), Arc::new(generator), dispatcher, &config);

    let port = config.port;
    let state = AppState::new(config, store, pipeline);
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    outbound.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
