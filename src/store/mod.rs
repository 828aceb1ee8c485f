//! Shared atomic store.
//!
//! # Data Flow
//! ```text
//! LockManager / RateLimiter
//!     → AtomicStore (one round trip per operation)
//!         → MemoryStore: native atomicity under a single mutex
//!         → CasStore<S>: versioned compare-and-swap, retried on conflict
//!     → script.rs (pure planning shared by both backends)
//! ```
//!
//! # Design Decisions
//! - Every mutation is a single atomic operation; no read-then-write from callers
//! - The store owns the clock for expiry and windows
//! - Multi-step operations are typed scripts rather than opaque source text
//! - Backends without scripting emulate it with versioned transactions

pub mod cas;
pub mod memory;
pub mod script;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::resilience::classify::{Classify, ErrorClass};

pub use cas::{CasStore, CasTxn, CasWrite, Versioned, VersionedStore};
pub use memory::MemoryStore;
pub use script::{Script, ScriptReply, WindowReply};

/// Errors raised by a shared store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("key '{key}' holds a {found} value")]
    WrongType { key: String, found: &'static str },

    #[error("compare-and-swap on '{key}' gave up after {attempts} conflicts")]
    Contention { key: String, attempts: u32 },

    #[error("unexpected reply to {script} script")]
    UnexpectedReply { script: &'static str },
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Contention { .. } => {
                ErrorClass::Transient
            }
            StoreError::WrongType { .. } | StoreError::UnexpectedReply { .. } => ErrorClass::Client,
        }
    }
}

/// Result of an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Value after the increment.
    pub value: u64,
    /// Time left before the counter expires.
    pub expires_in: Option<Duration>,
}

/// Value held under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Text(String),
    Counter(u64),
    /// Timestamped members of a sliding window, oldest first.
    Window(VecDeque<(Instant, String)>),
}

impl StoredValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoredValue::Text(_) => "text",
            StoredValue::Counter(_) => "counter",
            StoredValue::Window(_) => "window",
        }
    }
}

/// A live value together with its remaining lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub value: StoredValue,
    pub expires_in: Option<Duration>,
}

/// Contract the kernel needs from a shared store.
///
/// Implementations must make each method a single linearizable operation.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Set `key` to `value` with expiry `ttl` only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Increment a counter, setting `ttl` when the counter is created.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<Counter, StoreError>;

    /// Run a multi-step script in one round trip.
    async fn run(&self, script: Script) -> Result<ScriptReply, StoreError>;
}
