//! Dead-letter subsystem.
//!
//! # Data Flow
//! ```text
//! RetryError::Exhausted at a worker
//!     → sink.rs enqueue (stamp id and times, never fails the caller)
//!     → store.rs push (assign sequence, evict oldest when full)
//! Operator:
//!     → peek / peek_after / count / purge / record_attempt
//! ```

pub mod message;
pub mod sink;
pub mod store;

pub use message::{DeadLetter, FailureRecord, NewDeadLetter};
pub use sink::DeadLetterSink;
pub use store::{DeadLetterError, DeadLetterStore, MemoryDeadLetters, Pushed};
