//! Dead-letter sink.
//!
//! # Responsibilities
//! - Record operations that exhausted their retries
//! - Let operators inspect, page through and purge them
//!
//! # Design Decisions
//! - Enqueue never fails the caller; problems are logged and counted
//! - Page size is capped so one read cannot copy the whole store

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::DeadLetterConfig;
use crate::deadletter::message::{epoch_millis, DeadLetter, FailureRecord, NewDeadLetter};
use crate::deadletter::store::{DeadLetterError, DeadLetterStore, MemoryDeadLetters, Pushed};
use crate::observability::{EventBus, KernelEvent};

pub struct DeadLetterSink {
    store: Arc<dyn DeadLetterStore>,
    max_page: AtomicUsize,
    events: EventBus,
}

impl DeadLetterSink {
    pub fn new(store: Arc<dyn DeadLetterStore>, config: &DeadLetterConfig, events: EventBus) -> Self {
        Self {
            store,
            max_page: AtomicUsize::new(config.max_page.max(1)),
            events,
        }
    }

    /// Sink over an in-process store sized from `config`.
    pub fn in_memory(config: &DeadLetterConfig, events: EventBus) -> Self {
        Self::new(Arc::new(MemoryDeadLetters::new(config.capacity)), config, events)
    }

    pub fn set_max_page(&self, max_page: usize) {
        self.max_page.store(max_page.max(1), Ordering::Relaxed);
    }

    /// Record a failed operation. Returns its id, or `None` if it was dropped.
    pub async fn enqueue(&self, letter: NewDeadLetter) -> Option<Uuid> {
        let queue = letter.original_queue.clone();
        match self.store.push(letter.into_letter(epoch_millis())).await {
            Ok(pushed) => {
                self.pushed(&queue, &pushed);
                Some(pushed.id)
            }
            Err(e) => {
                self.dropped(&queue, &e);
                None
            }
        }
    }

    /// Record several failed operations; returns how many were stored.
    pub async fn enqueue_batch(&self, letters: Vec<NewDeadLetter>) -> usize {
        if letters.is_empty() {
            return 0;
        }
        let now = epoch_millis();
        let queues: Vec<String> = letters.iter().map(|l| l.original_queue.clone()).collect();
        let letters = letters.into_iter().map(|l| l.into_letter(now)).collect();
        match self.store.push_batch(letters).await {
            Ok(pushed) => {
                for (queue, p) in queues.iter().zip(&pushed) {
                    self.pushed(queue, p);
                }
                pushed.len()
            }
            Err(e) => {
                for queue in &queues {
                    self.dropped(queue, &e);
                }
                0
            }
        }
    }

    /// Snapshot `payload` and record it.
    pub async fn enqueue_snapshot<P: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &P,
        error: FailureRecord,
        attempts: u32,
        max_attempts: u32,
    ) -> Option<Uuid> {
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.enqueue(NewDeadLetter::new(queue, value, error, attempts, max_attempts))
                    .await
            }
            Err(e) => {
                self.dropped(queue, &DeadLetterError::Snapshot(e.to_string()));
                None
            }
        }
    }

    /// Up to `limit` entries, oldest first.
    pub async fn peek(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        self.store.peek(self.page(limit)).await
    }

    /// Entries after `cursor` (a sequence number; 0 starts from the beginning).
    pub async fn peek_after(&self, cursor: u64, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        self.store.peek_after(cursor, self.page(limit)).await
    }

    pub async fn count(&self) -> Result<usize, DeadLetterError> {
        self.store.count().await
    }

    pub async fn purge(&self) -> Result<usize, DeadLetterError> {
        let purged = self.store.purge().await?;
        tracing::info!(purged, "Dead letters purged");
        crate::observability::metrics::record_dead_letter_depth(0);
        Ok(purged)
    }

    /// Note another delivery attempt for `id`.
    pub async fn record_attempt(&self, id: Uuid) -> Result<Option<u32>, DeadLetterError> {
        self.store.record_attempt(id).await
    }

    /// Stop accepting entries. Later enqueues are dropped.
    pub async fn close(&self) {
        self.store.close().await;
        tracing::info!("Dead-letter sink closed");
    }

    fn page(&self, limit: usize) -> usize {
        limit.min(self.max_page.load(Ordering::Relaxed))
    }

    fn pushed(&self, queue: &str, pushed: &Pushed) {
        tracing::debug!(queue = %queue, id = %pushed.id, sequence = pushed.sequence, depth = pushed.depth, "Dead letter stored");
        if let Some(evicted) = &pushed.evicted {
            tracing::warn!(queue = %evicted.original_queue, id = %evicted.id, "Dead-letter store full, evicted oldest entry");
            self.events.emit(KernelEvent::DeadLetterEvicted {
                queue: evicted.original_queue.clone(),
            });
        }
        self.events.emit(KernelEvent::DeadLetterEnqueued {
            queue: queue.to_string(),
            depth: pushed.depth,
        });
    }

    fn dropped(&self, queue: &str, error: &DeadLetterError) {
        tracing::error!(queue = %queue, error = %error, "Dropping dead letter");
        self.events.emit(KernelEvent::DeadLetterDropped {
            queue: queue.to_string(),
            reason: error.reason().to_string(),
        });
    }
}

impl std::fmt::Debug for DeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterSink")
            .field("max_page", &self.max_page.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
