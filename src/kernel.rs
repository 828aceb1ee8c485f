//! The kernel: every component built once per process from one config.
//!
//! # Responsibilities
//! - Construct the registry, lock manager, rate limiter and dead-letter sink
//! - Hand out retry executors wired to a named breaker and the shutdown token
//! - Apply reloaded configs to the parts that can change at runtime
//! - Report health and drain at shutdown
//!
//! # Design Decisions
//! - Explicit object passed by reference; no process-global state
//! - Settings that size in-memory structures apply on restart only

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::admission::RateLimiter;
use crate::config::validation::validate_config;
use crate::config::{ConfigError, KernelConfig};
use crate::deadletter::{DeadLetterSink, DeadLetterStore, MemoryDeadLetters};
use crate::health::HealthReport;
use crate::lifecycle::Shutdown;
use crate::lock::LockManager;
use crate::observability::EventBus;
use crate::resilience::registry::CircuitRegistry;
use crate::resilience::retries::{RetryBudget, RetryExecutor, RetryPolicy};
use crate::store::AtomicStore;

pub struct Kernel {
    config: ArcSwap<KernelConfig>,
    events: EventBus,
    store: Arc<dyn AtomicStore>,
    circuits: Arc<CircuitRegistry>,
    locks: LockManager,
    rate_limiter: Arc<RateLimiter>,
    dead_letters: Arc<DeadLetterSink>,
    retry_budget: ArcSwapOption<RetryBudget>,
    shutdown: Shutdown,
}

impl Kernel {
    /// Validate `config` and build every component over `store`.
    pub fn start(config: KernelConfig, store: Arc<dyn AtomicStore>) -> Result<Self, ConfigError> {
        let dead_letters = Arc::new(MemoryDeadLetters::new(config.dead_letter.capacity));
        Self::start_with_dead_letters(config, store, dead_letters)
    }

    /// Like [`Kernel::start`] with a caller-provided dead-letter store.
    pub fn start_with_dead_letters(
        config: KernelConfig,
        store: Arc<dyn AtomicStore>,
        dead_letter_store: Arc<dyn DeadLetterStore>,
    ) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let events = EventBus::new(config.observability.event_buffer);
        let shutdown = Shutdown::new();
        let circuits = Arc::new(CircuitRegistry::new(config.circuit.clone(), events.clone()));
        let locks = LockManager::new(store.clone(), config.lock.clone(), events.clone())
            .with_cancellation(shutdown.token());
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone(),
            config.rate_limit.clone(),
            &circuits,
            events.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterSink::new(dead_letter_store, &config.dead_letter, events.clone()));
        let retry_budget = ArcSwapOption::from(budget_for(&config));

        tracing::info!(
            failure_threshold = config.circuit.failure_threshold,
            max_retries = config.retry.max_retries,
            rate_limit_strategy = ?config.rate_limit.strategy,
            dead_letter_capacity = config.dead_letter.capacity,
            "Kernel started"
        );

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            events,
            store,
            circuits,
            locks,
            rate_limiter,
            dead_letters,
            retry_budget,
            shutdown,
        })
    }

    pub fn config(&self) -> Arc<KernelConfig> {
        self.config.load_full()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn AtomicStore> {
        &self.store
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterSink> {
        &self.dead_letters
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Retry policy from the current config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.load().retry)
    }

    /// Executor retrying through the breaker named `circuit`.
    pub fn retry_executor(&self, circuit: &str) -> RetryExecutor {
        let mut executor = RetryExecutor::new(self.retry_policy())
            .with_breaker(self.circuits.get(circuit))
            .with_cancellation(self.shutdown.token());
        if let Some(budget) = self.retry_budget.load_full() {
            executor = executor.with_budget(budget);
        }
        executor
    }

    pub async fn health(&self) -> HealthReport {
        let depth = match self.dead_letters.count().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read dead-letter depth");
                None
            }
        };
        HealthReport::new(self.circuits.snapshots(), self.rate_limiter.is_degraded(), depth)
    }

    /// Apply a new config. Invalid configs are rejected and the current one kept.
    pub fn reload(&self, config: KernelConfig) -> Result<(), ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let current = self.config.load_full();

        if config.dead_letter.capacity != current.dead_letter.capacity
            || config.rate_limit.store_circuit != current.rate_limit.store_circuit
            || config.rate_limit.fallback_max_keys != current.rate_limit.fallback_max_keys
            || config.lock.key_prefix != current.lock.key_prefix
            || config.observability != current.observability
        {
            tracing::warn!("Some changed settings only take effect after a restart");
        }

        self.circuits.set_defaults(config.circuit.clone());
        self.locks.set_config(config.lock.clone());
        self.rate_limiter.set_config(config.rate_limit.clone());
        self.dead_letters.set_max_page(config.dead_letter.max_page);
        if config.retry != current.retry {
            self.retry_budget.store(budget_for(&config));
        }
        self.config.store(Arc::new(config));

        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// Cancel pending waits, stop taking dead letters and drop fallback windows.
    pub async fn drain(&self) {
        self.shutdown.trigger();
        self.rate_limiter.clear_fallback();
        self.dead_letters.close().await;
        tracing::info!("Kernel drained");
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("circuits", &self.circuits.len())
            .field("rate_limiter", &self.rate_limiter)
            .field("shutdown", &self.shutdown.is_triggered())
            .finish_non_exhaustive()
    }
}

fn budget_for(config: &KernelConfig) -> Option<Arc<RetryBudget>> {
    config
        .retry
        .budget_enabled
        .then(|| Arc::new(RetryBudget::from_config(&config.retry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use crate::store::MemoryStore;

    fn kernel() -> Kernel {
        Kernel::start(KernelConfig::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let mut config = KernelConfig::default();
        config.dead_letter.capacity = 0;
        let err = Kernel::start(config, Arc::new(MemoryStore::new())).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[tokio::test]
    async fn test_fresh_kernel_is_healthy() {
        let kernel = kernel();
        let report = kernel.health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.dead_letter_depth, Some(0));
        // The limiter registers its store breaker up front.
        assert_eq!(report.circuits.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_updates_defaults_and_keeps_on_invalid() {
        let kernel = kernel();
        let mut next = KernelConfig::default();
        next.circuit.failure_threshold = 9;
        next.retry.max_retries = 1;
        kernel.reload(next).unwrap();
        assert_eq!(kernel.circuits().get("new-dep").config().failure_threshold, 9);
        assert_eq!(kernel.retry_policy().max_retries, 1);

        let mut bad = KernelConfig::default();
        bad.circuit.failure_threshold = 0;
        assert!(kernel.reload(bad).is_err());
        assert_eq!(kernel.config().circuit.failure_threshold, 9);
    }

    #[tokio::test]
    async fn test_drain_cancels_and_closes() {
        let kernel = kernel();
        let token = kernel.shutdown().token();
        kernel.drain().await;
        assert!(token.is_cancelled());

        let id = kernel
            .dead_letters()
            .enqueue_snapshot(
                "orders",
                &"late",
                crate::deadletter::FailureRecord::new(crate::resilience::ErrorClass::Transient, "x"),
                1,
                1,
            )
            .await;
        assert!(id.is_none());
    }
}
