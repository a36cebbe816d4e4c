//! Async RabbitMQ publisher for outbound reply jobs.
//!
//! One connection and channel are shared by every task and re-established
//! lazily after a failure. Publishes use broker confirms, so a returned
//! `Ok` means the job is on disk at the broker.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::{OutboundJob, OUTBOUND_QUEUE};

/// Declare the outbound queue. Idempotent; used by publisher and consumer.
pub async fn declare_outbound_queue(channel: &Channel) -> Result<()> {
    channel
        .queue_declare(
            OUTBOUND_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare outbound queue")?;

    Ok(())
}

struct Link {
    connection: Connection,
    channel: Channel,
}

impl Link {
    async fn open(url: &str) -> Result<Self> {
        info!("rabbitmq_publisher_connecting");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let channel = connection
            .create_channel()
            .await
            .context("Failed to create channel")?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        declare_outbound_queue(&channel).await?;

        info!(queue = OUTBOUND_QUEUE, "rabbitmq_publisher_connected");

        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_usable(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Shared publisher handle. Cloning is cheap; clones share the link.
#[derive(Clone)]
pub struct Publisher {
    url: Arc<str>,
    link: Arc<Mutex<Option<Link>>>,
}

impl Publisher {
    /// No connection is made until the first publish.
    pub fn new(url: String) -> Self {
        Self {
            url: url.into(),
            link: Arc::new(Mutex::new(None)),
        }
    }

    /// A live channel, reconnecting when the previous link dropped.
    async fn channel(&self) -> Result<Channel> {
        let mut link = self.link.lock().await;

        if let Some(current) = link.as_ref() {
            if current.is_usable() {
                return Ok(current.channel.clone());
            }
            warn!("rabbitmq_publisher_link_lost");
        }

        let fresh = Link::open(&self.url).await?;
        let channel = fresh.channel.clone();
        *link = Some(fresh);
        Ok(channel)
    }

    /// Publish a reply job to the outbound queue and wait for the broker ack.
    pub async fn publish_outbound(&self, job: &OutboundJob) -> Result<()> {
        let channel = self.channel().await?;

        let body = serde_json::to_vec(job).context("Failed to serialize outbound job")?;
        let message_id = job.message_id();

        let confirmation = channel
            .basic_publish(
                "",
                OUTBOUND_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into()),
            )
            .await
            .context("Failed to publish to outbound queue")?
            .await
            .context("Failed to confirm publish")?;

        if confirmation.is_nack() {
            anyhow::bail!("Broker rejected outbound job {}", message_id);
        }

        info!(
            queue = OUTBOUND_QUEUE,
            message_id = %message_id,
            tenant_id = %job.tenant_id,
            body_length = body.len(),
            "rabbitmq_outbound_published"
        );

        Ok(())
    }

    /// Close the link, if one was opened.
    pub async fn close(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };

        if let Err(e) = link.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
        if let Err(e) = link.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("rabbitmq_publisher_closed");
    }
}
