//! RabbitMQ consumer for the outbound reply queue.
//!
//! Each delivery is an [`OutboundJob`]. The job is sent through Mailgun and
//! the outcome is written to the audit log by [`deliver`]; the message is
//! acked either way, since a failed send is already recorded.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::{signal, sync::Semaphore};
use tracing::{error, info, warn};

use replymint::outbound::{deliver, MailgunSender};
use replymint::queue::{declare_outbound_queue, OutboundJob, OUTBOUND_QUEUE};
use replymint::store::SqliteStore;
use replymint::Config;

/// Run the consumer until SIGINT/SIGTERM or the broker closes the stream.
pub async fn run(config: Config, url: &str) -> Result<()> {
    let store = SqliteStore::open(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to open database")?;
    let store = Arc::new(store);

    let sender = MailgunSender::from_config(&config).context("Failed to create Mailgun client")?;
    if !sender.is_configured() {
        warn!("mailgun_not_configured_sends_will_fail");
    }
    let sender = Arc::new(sender);

    info!(url_length = url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    let prefetch_count = config.worker_concurrency.clamp(1, u16::MAX as usize) as u16;
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    declare_outbound_queue(&channel).await?;

    let mut consumer = channel
        .basic_consume(
            OUTBOUND_QUEUE,
            "replymint-sender",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = OUTBOUND_QUEUE, "rabbitmq_consumer_started");

    let channel = Arc::new(channel);
    let in_flight = Arc::new(Semaphore::new(prefetch_count as usize));
    let preview_max_chars = config.preview_max_chars;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("sender_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let permit = match Arc::clone(&in_flight).acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };

                        let channel = Arc::clone(&channel);
                        let store = Arc::clone(&store);
                        let sender = Arc::clone(&sender);
                        let delivery_tag = delivery.delivery_tag;

                        tokio::spawn(async move {
                            let _permit = permit;

                            let job: OutboundJob = match serde_json::from_slice(&delivery.data) {
                                Ok(job) => job,
                                Err(e) => {
                                    error!(
                                        delivery_tag = delivery_tag,
                                        error = %e,
                                        "outbound_job_parse_failed"
                                    );
                                    // Unparseable jobs would fail again; drop them.
                                    reject(&channel, delivery_tag).await;
                                    return;
                                }
                            };

                            info!(
                                queue = OUTBOUND_QUEUE,
                                message_id = %job.message_id(),
                                tenant_id = %job.tenant_id,
                                delivery_tag = delivery_tag,
                                "outbound_job_received"
                            );

                            // Outcome is recorded by deliver
                            let _ = deliver(sender.as_ref(), store.as_ref(), &job, preview_max_chars).await;

                            if let Err(e) = channel
                                .basic_ack(delivery_tag, BasicAckOptions::default())
                                .await
                            {
                                error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    // Let sends already under way finish and ack before the connection goes.
    let _drained = in_flight.acquire_many(prefetch_count as u32).await;

    if let Err(e) = conn.close(200, "shutdown").await {
        warn!(error = %e, "rabbitmq_close_failed");
    }

    info!("sender_shutdown_complete");
    Ok(())
}

async fn reject(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue: false,
                ..Default::default()
            },
        )
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
    }
}

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
}
