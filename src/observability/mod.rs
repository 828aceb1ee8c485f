//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Kernel components produce:
//!     → logging.rs (structured tracing events at each decision point)
//!     → events.rs (typed state-change events on a broadcast bus)
//!         → metrics.rs (every event is mirrored into a counter or gauge)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape, optional)
//!     → Monitoring collaborators subscribed to the event bus
//! ```
//!
//! # Design Decisions
//! - Emitting never blocks and never fails the caller
//! - Metrics are cheap (atomic increments)
//! - The event schema is owned by subscribers; the bus only broadcasts

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{EventBus, KernelEvent};
