//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use resilience_kernel::config::KernelConfig;
use resilience_kernel::resilience::{Classify, ErrorClass};
use resilience_kernel::store::{AtomicStore, MemoryStore};
use resilience_kernel::Kernel;

/// Error returned by [`Dependency`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// 5xx-equivalent.
    Down,
    /// 4xx-equivalent.
    Rejected,
}

impl std::fmt::Display for DependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyError::Down => f.write_str("dependency returned 503"),
            DependencyError::Rejected => f.write_str("dependency returned 400"),
        }
    }
}

impl std::error::Error for DependencyError {}

impl Classify for DependencyError {
    fn class(&self) -> ErrorClass {
        match self {
            DependencyError::Down => ErrorClass::from_status(503),
            DependencyError::Rejected => ErrorClass::from_status(400),
        }
    }
}

/// A programmable downstream service that counts its calls.
#[derive(Debug, Default)]
pub struct Dependency {
    down: AtomicBool,
    calls: AtomicU32,
}

impl Dependency {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> Result<&'static str, DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.down.load(Ordering::SeqCst) {
            Err(DependencyError::Down)
        } else {
            Ok("ok")
        }
    }
}

/// Config with small, test-friendly numbers.
pub fn test_config() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.circuit.failure_threshold = 3;
    config.circuit.reset_timeout_ms = 1_000;
    config.retry.max_retries = 5;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.dead_letter.capacity = 100;
    config
}

pub fn start_kernel(config: KernelConfig) -> (Kernel, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let kernel = Kernel::start(config, store.clone() as Arc<dyn AtomicStore>).unwrap();
    (kernel, store)
}
