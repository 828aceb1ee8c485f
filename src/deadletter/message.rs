//! Dead-letter records.

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resilience::classify::{Classify, ErrorClass};

/// The classified error that exhausted an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub class: ErrorClass,
    pub message: String,
}

impl FailureRecord {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn from_error<E: Classify + Display>(error: &E) -> Self {
        Self::new(error.class(), error.to_string())
    }
}

/// A stored dead letter. Only `attempts` changes after enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    /// Assigned by the store; strictly increasing in insertion order.
    pub sequence: u64,
    pub original_queue: String,
    pub payload: serde_json::Value,
    pub error: FailureRecord,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Milliseconds since the Unix epoch.
    pub first_failed_at: u64,
    /// Milliseconds since the Unix epoch.
    pub failed_at: u64,
}

/// What a caller hands to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub original_queue: String,
    pub payload: serde_json::Value,
    pub error: FailureRecord,
    pub attempts: u32,
    pub max_attempts: u32,
    pub first_failed_at: Option<u64>,
}

impl NewDeadLetter {
    pub fn new(
        original_queue: impl Into<String>,
        payload: serde_json::Value,
        error: FailureRecord,
        attempts: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            original_queue: original_queue.into(),
            payload,
            error,
            attempts,
            max_attempts,
            first_failed_at: None,
        }
    }

    /// When the first attempt failed, in epoch milliseconds. Defaults to enqueue time.
    pub fn first_failed_at(mut self, epoch_ms: u64) -> Self {
        self.first_failed_at = Some(epoch_ms);
        self
    }

    pub(crate) fn into_letter(self, now_ms: u64) -> DeadLetter {
        DeadLetter {
            id: Uuid::new_v4(),
            sequence: 0,
            original_queue: self.original_queue,
            payload: self.payload,
            error: self.error,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            first_failed_at: self.first_failed_at.unwrap_or(now_ms),
            failed_at: now_ms,
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
