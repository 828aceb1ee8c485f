//! Process-wide registry of named circuit breakers.
//!
//! # Responsibilities
//! - Create breakers lazily per resource name
//! - Hand out shared references so every caller sees the same state
//! - Report snapshots for health checks
//!
//! # Design Decisions
//! - Owned by the kernel and passed by reference, never a global
//! - Default config is hot-swappable; existing breakers keep the config they were built with

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::CircuitConfig;
use crate::observability::EventBus;
use crate::resilience::circuit_breaker::{CallError, CircuitBreaker, CircuitSnapshot};
use crate::resilience::classify::Classify;

pub struct CircuitRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: ArcSwap<CircuitConfig>,
    events: EventBus,
}

impl CircuitRegistry {
    pub fn new(defaults: CircuitConfig, events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults: ArcSwap::from_pointee(defaults),
            events,
        }
    }

    /// Breaker for `name`, created with the current defaults if missing.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        let defaults = self.defaults.load_full();
        self.get_with(name, (*defaults).clone())
    }

    /// Breaker for `name`, created with `config` if missing.
    pub fn get_with(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, config, self.events.clone()))
            })
            .value()
            .clone()
    }

    /// Run `op` through the breaker named `name`.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.get(name).execute(op).await
    }

    /// Reset the breaker named `name`; `false` if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn set_defaults(&self, defaults: CircuitConfig) {
        self.defaults.store(Arc::new(defaults));
    }

    pub fn defaults(&self) -> CircuitConfig {
        (*self.defaults.load_full()).clone()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;

    #[test]
    fn test_same_name_same_breaker() {
        let registry = CircuitRegistry::new(CircuitConfig::default(), EventBus::default());
        let a = registry.get("payments");
        let b = registry.get("payments");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_defaults_apply_to_new_breakers_only() {
        let registry = CircuitRegistry::new(CircuitConfig::default(), EventBus::default());
        let old = registry.get("old");
        registry.set_defaults(CircuitConfig { failure_threshold: 42, ..Default::default() });
        let new = registry.get("new");
        assert_eq!(old.config().failure_threshold, CircuitConfig::default().failure_threshold);
        assert_eq!(new.config().failure_threshold, 42);
    }

    #[tokio::test]
    async fn test_execute_and_snapshot() {
        let registry = CircuitRegistry::new(
            CircuitConfig { failure_threshold: 1, ..Default::default() },
            EventBus::default(),
        );
        let res = registry
            .execute("cache", || async {
                Err::<(), _>(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            })
            .await;
        assert!(matches!(res, Err(CallError::Failed(_))));

        let snapshots = registry.snapshots();
        assert_eq!(snapshots[0].name, "cache");
        assert_eq!(snapshots[0].state, CircuitState::Open);

        assert!(registry.reset("cache"));
        assert!(!registry.reset("missing"));
        assert_eq!(registry.get("cache").state(), CircuitState::Closed);
    }
}
