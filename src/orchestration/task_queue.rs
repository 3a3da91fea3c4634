//! # Task Queue
//!
//! Leased work queue over [`MessageHandlerStore`]. Delivery is at-least-once:
//! a worker leases items, processes them and deletes them; an item whose
//! worker died becomes eligible again once its lease expires.
//!
//! ## Worker Loop
//!
//! [`QueueWorker::run_once`] leases a batch for every registered
//! [`MessageHandler`] and processes the batch concurrently. Items are keyed
//! so that one item covers one unit of state (a flow, a client check-in),
//! which is what makes concurrent processing inside a batch safe.
//!
//! | handler outcome | queue action |
//! |---|---|
//! | `Ok` | delete (generation-checked) |
//! | retryable error | release, redelivered on the next poll |
//! | other error | kept leased, redelivered after lease expiry |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::database::DataStore;
use crate::error::Result;
use crate::logging::log_queue_operation;
use crate::models::MessageHandlerRequest;

/// Processor for one kind of queued work
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn handler_name(&self) -> &'static str;

    /// Process one leased item. Must be idempotent: the same item can be
    /// delivered more than once.
    async fn process(&self, item: &MessageHandlerRequest) -> Result<()>;
}

/// Enqueue / lease / delete over the durable store, stamped with one owner
pub struct TaskQueue {
    store: Arc<dyn DataStore>,
    owner: String,
    lease_duration: Duration,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn DataStore>, owner: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            lease_duration,
        }
    }

    /// Identity stamped into `leased_by`
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub async fn enqueue(&self, items: Vec<MessageHandlerRequest>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        debug!(count = items.len(), "Enqueueing message handler requests");
        self.store.enqueue_message_handler_requests(items).await
    }

    /// Enqueue a single item; re-enqueueing a pending key bumps its generation
    pub async fn enqueue_one(
        &self,
        handler_name: &str,
        request_id: impl Into<String>,
        payload: Value,
    ) -> Result<()> {
        self.enqueue(vec![MessageHandlerRequest::new(
            handler_name,
            request_id,
            payload,
            Utc::now(),
        )])
        .await
    }

    pub async fn lease(&self, handler_name: &str, limit: usize) -> Result<Vec<MessageHandlerRequest>> {
        self.lease_at(handler_name, limit, Utc::now()).await
    }

    /// Lease with an explicit clock, for callers that drive time themselves
    pub async fn lease_at(
        &self,
        handler_name: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageHandlerRequest>> {
        self.store
            .lease_message_handler_requests(handler_name, &self.owner, self.lease_duration, limit, now)
            .await
    }

    /// Remove processed items; items re-enqueued since the lease survive
    pub async fn delete(&self, items: &[MessageHandlerRequest]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        self.store.delete_message_handler_requests(items).await
    }

    /// Give items back for immediate redelivery
    pub async fn release(&self, items: &[MessageHandlerRequest]) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        self.store
            .release_message_handler_requests(items, &self.owner)
            .await
    }

    pub async fn pending(&self, handler_name: &str) -> Result<usize> {
        self.store.count_message_handler_requests(handler_name).await
    }
}

/// Counters of one worker pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCycle {
    pub leased: usize,
    pub processed: usize,
    pub released: usize,
    pub failed: usize,
}

impl WorkerCycle {
    fn absorb(&mut self, other: WorkerCycle) {
        self.leased += other.leased;
        self.processed += other.processed;
        self.released += other.released;
        self.failed += other.failed;
    }
}

/// Lease -> process -> delete loop over a set of handlers
pub struct QueueWorker {
    queue: Arc<TaskQueue>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    batch_size: usize,
}

impl QueueWorker {
    pub fn new(queue: Arc<TaskQueue>, batch_size: usize) -> Self {
        Self {
            queue,
            handlers: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.handler_name()).collect()
    }

    /// One pass over every handler
    pub async fn run_once(&self) -> Result<WorkerCycle> {
        let mut cycle = WorkerCycle::default();
        for handler in &self.handlers {
            cycle.absorb(self.process_batch(handler.as_ref()).await?);
        }
        Ok(cycle)
    }

    #[instrument(skip(self, handler), fields(handler = handler.handler_name()))]
    async fn process_batch(&self, handler: &dyn MessageHandler) -> Result<WorkerCycle> {
        let name = handler.handler_name();
        let items = self.queue.lease(name, self.batch_size).await?;
        if items.is_empty() {
            return Ok(WorkerCycle::default());
        }

        let outcomes = join_all(items.iter().map(|item| handler.process(item))).await;

        let mut done = Vec::new();
        let mut retry = Vec::new();
        let mut failed = 0;
        for (item, outcome) in items.iter().zip(outcomes) {
            match outcome {
                Ok(()) => done.push(item.clone()),
                Err(e) if e.is_retryable() => {
                    debug!(request_id = %item.request_id, error = %e, "Releasing item for retry");
                    retry.push(item.clone());
                }
                Err(e) => {
                    error!(
                        request_id = %item.request_id,
                        error = %e,
                        "Message handler failed; item will be redelivered after lease expiry"
                    );
                    failed += 1;
                }
            }
        }

        let deleted = self.queue.delete(&done).await?;
        let released = self.queue.release(&retry).await?;
        if deleted < done.len() {
            debug!(
                superseded = done.len() - deleted,
                "Items re-enqueued while leased stay queued"
            );
        }
        log_queue_operation("process_batch", name, items.len(), None);

        Ok(WorkerCycle {
            leased: items.len(),
            processed: done.len(),
            released,
            failed,
        })
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(&self, poll_interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            owner = %self.queue.owner(),
            handlers = ?self.handler_names(),
            "Starting message handler worker"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(cycle) => cycle.leased == 0,
                Err(e) => {
                    warn!(error = %e, "Worker pass failed");
                    true
                }
            };
            // busy workers continue immediately for throughput
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(owner = %self.queue.owner(), "Message handler worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDataStore;
    use crate::error::HuntsmanError;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Scripted {
        seen: Mutex<Vec<String>>,
        fail_with: Option<fn() -> HuntsmanError>,
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        fn handler_name(&self) -> &'static str {
            "scripted"
        }

        async fn process(&self, item: &MessageHandlerRequest) -> Result<()> {
            self.seen.lock().push(item.request_id.clone());
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    fn queue(store: Arc<InMemoryDataStore>) -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(store, "worker-1", Duration::seconds(60)))
    }

    #[tokio::test]
    async fn test_processed_items_are_deleted() {
        let store = Arc::new(InMemoryDataStore::new());
        let queue = queue(store);
        queue.enqueue_one("scripted", "a", json!({})).await.unwrap();
        queue.enqueue_one("scripted", "b", json!({})).await.unwrap();

        let handler = Arc::new(Scripted {
            seen: Mutex::new(Vec::new()),
            fail_with: None,
        });
        let worker = QueueWorker::new(queue.clone(), 10).with_handler(handler.clone());
        let cycle = worker.run_once().await.unwrap();

        assert_eq!(cycle.leased, 2);
        assert_eq!(cycle.processed, 2);
        assert_eq!(queue.pending("scripted").await.unwrap(), 0);
        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_released() {
        let store = Arc::new(InMemoryDataStore::new());
        let queue = queue(store);
        queue.enqueue_one("scripted", "a", json!({})).await.unwrap();

        let handler = Arc::new(Scripted {
            seen: Mutex::new(Vec::new()),
            fail_with: Some(|| HuntsmanError::concurrent_modification("flow C.1/F1")),
        });
        let worker = QueueWorker::new(queue.clone(), 10).with_handler(handler);
        let cycle = worker.run_once().await.unwrap();
        assert_eq!(cycle.released, 1);

        // released items can be leased again straight away
        assert_eq!(queue.lease("scripted", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_waits_for_lease_expiry() {
        let store = Arc::new(InMemoryDataStore::new());
        let queue = queue(store);
        queue.enqueue_one("scripted", "a", json!({})).await.unwrap();

        let handler = Arc::new(Scripted {
            seen: Mutex::new(Vec::new()),
            fail_with: Some(|| HuntsmanError::ValidationError("bad item".into())),
        });
        let worker = QueueWorker::new(queue.clone(), 10).with_handler(handler);
        assert_eq!(worker.run_once().await.unwrap().failed, 1);

        assert!(queue.lease("scripted", 10).await.unwrap().is_empty());
        let later = Utc::now() + Duration::seconds(61);
        assert_eq!(queue.lease_at("scripted", 10, later).await.unwrap().len(), 1);
    }
}
