//! Hand-off of generated replies to the sender.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{deliver_shared, outbound_entry, OutboundSender};
use crate::queue::{OutboundJob, Publisher};
use crate::store::{AuditLog, EmailStatus};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to enqueue outbound job: {0}")]
    Queue(String),

    #[error("outbound dispatcher is shut down")]
    Closed,
}

/// Accepts a reply for asynchronous delivery. Returning `Ok` means the job
/// is owned by the dispatcher; the send outcome is recorded later.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboundDispatcher: Send + Sync {
    async fn dispatch(&self, job: OutboundJob) -> Result<(), DispatchError>;
}

/// Sends from a task spawned in the current process. Used when no queue is
/// configured. At most `concurrency` sends run at once.
///
/// Every accepted job ends with an outbound audit entry: [`close`] waits for
/// spawned sends, including those still waiting for a permit.
///
/// [`close`]: InlineDispatcher::close
#[derive(Clone)]
pub struct InlineDispatcher {
    sender: Arc<dyn OutboundSender>,
    audit: Arc<dyn AuditLog>,
    permits: Arc<Semaphore>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    closed: Arc<AtomicBool>,
    preview_max_chars: usize,
}

impl InlineDispatcher {
    pub fn new(
        sender: Arc<dyn OutboundSender>,
        audit: Arc<dyn AuditLog>,
        concurrency: usize,
        preview_max_chars: usize,
    ) -> Self {
        Self {
            sender,
            audit,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
            preview_max_chars,
        }
    }

    /// Stop accepting jobs and wait for every accepted send to finish.
    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        info!(pending = tasks.len(), "inline_dispatcher_draining");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "outbound_send_task_failed");
            }
        }

        self.permits.close();
        info!("inline_dispatcher_closed");
    }
}

#[async_trait]
impl OutboundDispatcher for InlineDispatcher {
    async fn dispatch(&self, job: OutboundJob) -> Result<(), DispatchError> {
        let mut tasks = self.tasks.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }

        // Reap finished sends so the set stays small.
        while tasks.try_join_next().is_some() {}

        let permits = Arc::clone(&self.permits);
        let sender = Arc::clone(&self.sender);
        let audit = Arc::clone(&self.audit);
        let preview_max_chars = self.preview_max_chars;

        info!(tenant_id = %job.tenant_id, to = %job.to, "outbound_dispatched_inline");

        tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(tenant_id = %job.tenant_id, "outbound_dispatcher_closed");
                    let entry = outbound_entry(
                        &job,
                        EmailStatus::Failed,
                        None,
                        Some(DispatchError::Closed.to_string()),
                        preview_max_chars,
                    );
                    if let Err(e) = audit.record(&entry).await {
                        warn!(tenant_id = %job.tenant_id, error = %e, "audit_log_write_failed");
                    }
                    return;
                }
            };
            // Outcome is recorded by deliver
            let _ = deliver_shared(sender, audit, job, preview_max_chars).await;
        });

        Ok(())
    }
}

/// Publishes to the durable `outbound_replies` queue for the sender worker.
#[derive(Clone)]
pub struct QueueDispatcher {
    publisher: Publisher,
}

impl QueueDispatcher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }
}

#[async_trait]
impl OutboundDispatcher for QueueDispatcher {
    async fn dispatch(&self, job: OutboundJob) -> Result<(), DispatchError> {
        self.publisher.publish_outbound(&job).await.map_err(|e| {
            error!(tenant_id = %job.tenant_id, error = %e, "outbound_publish_failed");
            DispatchError::Queue(format!("{:#}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::outbound::{MockOutboundSender, SendError, SentMessage};
    use crate::store::{Direction, EmailStatus, SqliteStore};

    fn job() -> OutboundJob {
        OutboundJob::reply(
            "support@tenant.example".to_string(),
            "c@customer.example".to_string(),
            "support@tenant.example".to_string(),
            "Hi",
            "Hello there".to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn test_inline_dispatch_sends_in_background() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let mut sender = MockOutboundSender::new();
        sender.expect_send().times(1).returning(|_| {
            Ok(SentMessage {
                delivery_id: "d1".to_string(),
            })
        });

        let dispatcher = InlineDispatcher::new(Arc::new(sender), store.clone(), 4, 256);
        dispatcher.dispatch(job()).await.unwrap();

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = store.recent("support@tenant.example", 10, 0).await.unwrap();
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, Direction::Outbound);
        assert_eq!(entries[0].status, EmailStatus::Sent);
        assert_eq!(entries[0].delivery_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn test_inline_dispatch_rejects_after_close() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let mut sender = MockOutboundSender::new();
        sender.expect_send().times(0);

        let dispatcher = InlineDispatcher::new(Arc::new(sender), store, 4, 256);
        dispatcher.close().await;

        assert!(matches!(
            dispatcher.dispatch(job()).await,
            Err(DispatchError::Closed)
        ));
    }

    struct SlowSender;

    #[async_trait]
    impl OutboundSender for SlowSender {
        async fn send(&self, _job: &OutboundJob) -> Result<SentMessage, SendError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(SentMessage {
                delivery_id: "slow".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_close_drains_jobs_waiting_for_a_permit() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let dispatcher = InlineDispatcher::new(Arc::new(SlowSender), store.clone(), 1, 256);

        for _ in 0..3 {
            dispatcher.dispatch(job()).await.unwrap();
        }
        dispatcher.close().await;

        let entries = store.recent("support@tenant.example", 10, 0).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries
            .iter()
            .all(|e| e.status == EmailStatus::Sent && e.direction == Direction::Outbound));
        assert!(matches!(
            dispatcher.dispatch(job()).await,
            Err(DispatchError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_queue_dispatch_reports_broker_failure() {
        let dispatcher = QueueDispatcher::new(Publisher::new("amqp://127.0.0.1:1/%2f".to_string()));

        let err = dispatcher.dispatch(job()).await.unwrap_err();

        assert!(matches!(err, DispatchError::Queue(_)));
    }
}
