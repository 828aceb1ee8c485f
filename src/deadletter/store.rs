//! Dead-letter storage.
//!
//! # Design Decisions
//! - Bounded; the oldest entry is evicted to make room
//! - Entries stay in insertion order so reads never sort
//! - Cursor reads binary-search on the sequence number

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::deadletter::message::DeadLetter;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeadLetterError {
    #[error("dead-letter store is closed")]
    Closed,

    #[error("payload could not be captured: {0}")]
    Snapshot(String),

    #[error("dead-letter storage failed: {0}")]
    Storage(String),
}

impl DeadLetterError {
    /// Short label used for drop metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DeadLetterError::Closed => "closed",
            DeadLetterError::Snapshot(_) => "snapshot",
            DeadLetterError::Storage(_) => "storage",
        }
    }
}

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq)]
pub struct Pushed {
    pub id: Uuid,
    pub sequence: u64,
    /// Entries held after the push.
    pub depth: usize,
    /// Entry removed to make room, if any.
    pub evicted: Option<DeadLetter>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store `letter`, assigning its sequence number.
    async fn push(&self, letter: DeadLetter) -> Result<Pushed, DeadLetterError>;

    /// Store several letters. Stops at the first failure.
    async fn push_batch(&self, letters: Vec<DeadLetter>) -> Result<Vec<Pushed>, DeadLetterError> {
        let mut pushed = Vec::with_capacity(letters.len());
        for letter in letters {
            pushed.push(self.push(letter).await?);
        }
        Ok(pushed)
    }

    /// Up to `limit` entries, oldest first.
    async fn peek(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Up to `limit` entries with a sequence greater than `cursor`, oldest first.
    async fn peek_after(&self, cursor: u64, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError>;

    async fn count(&self) -> Result<usize, DeadLetterError>;

    /// Remove everything, returning how many entries were dropped.
    async fn purge(&self) -> Result<usize, DeadLetterError>;

    /// Bump the attempt counter of `id`, returning the new value.
    async fn record_attempt(&self, id: Uuid) -> Result<Option<u32>, DeadLetterError>;

    /// Refuse further pushes.
    async fn close(&self);
}

#[derive(Debug)]
struct Letters {
    entries: VecDeque<DeadLetter>,
    next_sequence: u64,
    closed: bool,
}

/// In-process bounded store.
#[derive(Debug)]
pub struct MemoryDeadLetters {
    capacity: usize,
    inner: Mutex<Letters>,
}

impl MemoryDeadLetters {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Letters {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_sequence: 1,
                closed: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetters {
    async fn push(&self, mut letter: DeadLetter) -> Result<Pushed, DeadLetterError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DeadLetterError::Closed);
        }
        letter.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let (id, sequence) = (letter.id, letter.sequence);

        let evicted = if inner.entries.len() >= self.capacity {
            inner.entries.pop_front()
        } else {
            None
        };
        inner.entries.push_back(letter);
        Ok(Pushed {
            id,
            sequence,
            depth: inner.entries.len(),
            evicted,
        })
    }

    async fn peek(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let inner = self.inner.lock();
        Ok(inner.entries.iter().take(limit).cloned().collect())
    }

    async fn peek_after(&self, cursor: u64, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let inner = self.inner.lock();
        let start = inner.entries.partition_point(|l| l.sequence <= cursor);
        Ok(inner.entries.range(start..).take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<usize, DeadLetterError> {
        Ok(self.inner.lock().entries.len())
    }

    async fn purge(&self) -> Result<usize, DeadLetterError> {
        let mut inner = self.inner.lock();
        let purged = inner.entries.len();
        inner.entries.clear();
        Ok(purged)
    }

    async fn record_attempt(&self, id: Uuid) -> Result<Option<u32>, DeadLetterError> {
        let mut inner = self.inner.lock();
        Ok(inner.entries.iter_mut().find(|l| l.id == id).map(|letter| {
            letter.attempts = letter.attempts.saturating_add(1);
            letter.attempts
        }))
    }

    async fn close(&self) {
        self.inner.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::message::{FailureRecord, NewDeadLetter};
    use crate::resilience::classify::ErrorClass;

    fn letter(n: u32) -> DeadLetter {
        NewDeadLetter::new(
            "orders",
            serde_json::json!({ "n": n }),
            FailureRecord::new(ErrorClass::Transient, "timeout"),
            3,
            3,
        )
        .into_letter(1_000)
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let store = MemoryDeadLetters::new(2);
        for n in 0..3 {
            store.push(letter(n)).await.unwrap();
        }
        let entries = store.peek(10).await.unwrap();
        let ns: Vec<_> = entries.iter().map(|l| l.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2]);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_peek_after_pages_by_sequence() {
        let store = MemoryDeadLetters::new(10);
        store.push_batch((0..5).map(letter).collect()).await.unwrap();

        let first = store.peek_after(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|l| l.sequence).collect::<Vec<_>>(), vec![1, 2]);
        let next = store.peek_after(first[1].sequence, 10).await.unwrap();
        assert_eq!(next.iter().map(|l| l.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(store.peek_after(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_attempt_and_close() {
        let store = MemoryDeadLetters::new(10);
        let pushed = store.push(letter(0)).await.unwrap();
        assert_eq!(store.record_attempt(pushed.id).await.unwrap(), Some(4));
        assert_eq!(store.record_attempt(Uuid::new_v4()).await.unwrap(), None);

        store.close().await;
        assert_eq!(store.push(letter(1)).await.unwrap_err(), DeadLetterError::Closed);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
