//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → retries.rs (classify failure, back off, consult budget)
//!     → registry.rs (look up the named breaker)
//!     → circuit_breaker.rs (fail fast while open, single probe when half-open)
//!     → timeouts.rs (per-call deadline)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; a call that outlives its deadline is a dependency failure
//! - Only transient errors are retried or counted toward a circuit
//! - Retries stop the moment the protecting circuit opens
//! - Breakers live in an explicit registry, never in globals

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod registry;
pub mod retries;
pub mod timeouts;

pub use backoff::Backoff;
pub use circuit_breaker::{CallError, CircuitBreaker, CircuitRejection, CircuitSnapshot, CircuitState};
pub use classify::{Classify, ErrorClass};
pub use registry::CircuitRegistry;
pub use retries::{with_retry, RetryBudget, RetryError, RetryExecutor, RetryPolicy};
