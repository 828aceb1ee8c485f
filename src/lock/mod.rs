//! Distributed mutual exclusion.
//!
//! # Data Flow
//! ```text
//! with_lock(resource)
//!     → manager.rs acquire (AcquireFenced script: lock key + fence counter)
//!     → caller work, bounded by a deadline, carrying the fencing token
//!     → manager.rs release (delete-if-equals)
//! Resource owner:
//!     → fencing.rs rejects writes carrying an older token
//! ```

pub mod fencing;
pub mod handle;
pub mod manager;

pub use fencing::{FencingGate, StaleToken};
pub use handle::LockHandle;
pub use manager::{LockError, LockManager, LockOptions};
