//! Health reporting subsystem.
//!
//! # Data Flow
//! ```text
//! Kernel::health()
//!     → circuit snapshots from the registry
//!     → rate limiter degradation flag
//!     → dead-letter depth
//!     → report.rs folds them into one status
//! ```
//!
//! # Design Decisions
//! - Reports carry states and counts, never error payloads
//! - Any open or half-open circuit, or a degraded limiter, makes the kernel degraded

pub mod report;

pub use report::{HealthReport, HealthStatus};
