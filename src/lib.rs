//! Resilience and coordination kernel.
//!
//! # Architecture Overview
//!
//! ```text
//!   worker ──▶ RetryExecutor ──▶ CircuitBreaker ──▶ dependency
//!                   │ exhausted
//!                   ▼
//!             DeadLetterSink
//!
//!   inbound ──▶ RateLimiter ──▶ AtomicStore (fallback: local windows)
//!   multi-step work ──▶ LockManager::with_lock ──▶ AtomicStore
//!
//!   Kernel owns all of the above, plus config reload, health and drain.
//! ```

// Core subsystems
pub mod config;
pub mod kernel;
pub mod store;

// Coordination
pub mod admission;
pub mod deadletter;
pub mod lock;
pub mod resilience;

// Cross-cutting concerns
pub mod health;
pub mod lifecycle;
pub mod observability;

pub use config::KernelConfig;
pub use kernel::Kernel;
pub use lifecycle::Shutdown;
