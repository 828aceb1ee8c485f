//! Admission control.
//!
//! # Data Flow
//! ```text
//! check(key, max, window)
//!     → limiter.rs (breaker "rate-limit-store" → one store round trip)
//!     → on store failure or open circuit: local_window.rs
//!     → RateDecision { allowed, remaining, retry_after_secs, source }
//! ```

pub mod decision;
pub mod limiter;
pub mod local_window;

pub use decision::{DecisionSource, RateDecision};
pub use limiter::{RateLimitError, RateLimiter, STORE_CIRCUIT};
pub use local_window::LocalWindows;
