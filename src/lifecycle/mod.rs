//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load config → Validate → Kernel::start builds every component
//!
//! Shutdown (shutdown.rs):
//!     Signal received → cancel token → backoff and lock waits abort → Kernel::drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One cancellation token per kernel, cloned into every waiting component
//! - Drain closes the dead-letter sink last so late failures are still logged

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown;
