//! Admission control backed by the shared store.
//!
//! # Responsibilities
//! - Count admissions per key in one atomic store round trip
//! - Guard the store path with the `rate-limit-store` circuit breaker
//! - Answer from local windows while the store is failing
//! - Discard local state once the store answers again
//!
//! # Design Decisions
//! - Never fails open: the fallback enforces the same `(key, max, window)`
//! - Fallback counts are not reconciled with the store after recovery
//! - `max = 0` denies without a round trip

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use uuid::Uuid;

use crate::admission::decision::{DecisionSource, RateDecision};
use crate::admission::local_window::LocalWindows;
use crate::config::{RateLimitConfig, RateLimitStrategy};
use crate::observability::{EventBus, KernelEvent};
use crate::resilience::circuit_breaker::{CallError, CircuitBreaker};
use crate::resilience::classify::{Classify, ErrorClass};
use crate::resilience::registry::CircuitRegistry;
use crate::resilience::timeouts::with_deadline;
use crate::store::{AtomicStore, Script, StoreError};

/// Breaker name guarding the store path.
pub const STORE_CIRCUIT: &str = "rate-limit-store";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limit window must be greater than zero")]
    ZeroWindow,
}

impl Classify for RateLimitError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Client
    }
}

pub struct RateLimiter {
    store: Arc<dyn AtomicStore>,
    breaker: Arc<CircuitBreaker>,
    config: ArcSwap<RateLimitConfig>,
    local: LocalWindows,
    degraded: AtomicBool,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        config: RateLimitConfig,
        registry: &CircuitRegistry,
        events: EventBus,
    ) -> Self {
        let breaker = registry.get_with(STORE_CIRCUIT, config.store_circuit.clone());
        let local = LocalWindows::new(config.fallback_max_keys, config.fallback_sweep_every);
        Self {
            store,
            breaker,
            config: ArcSwap::from_pointee(config),
            local,
            degraded: AtomicBool::new(false),
            events,
        }
    }

    /// Admit or deny one request for `key`, allowing `max` per `window`.
    pub async fn check(&self, key: &str, max: u32, window: Duration) -> Result<RateDecision, RateLimitError> {
        if window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        let decision = if max == 0 {
            RateDecision::denied(0, window, window, DecisionSource::Local)
        } else {
            match self.shared_check(key, max, window).await {
                Ok(decision) => {
                    self.recovered();
                    decision
                }
                Err(err) => {
                    self.degrade(&err);
                    self.local.check(key, max, window)
                }
            }
        };

        if !decision.allowed {
            tracing::debug!(
                key = %key,
                limit = max,
                retry_after_secs = decision.retry_after_secs,
                source = decision.source.as_str(),
                "Rate limit exceeded"
            );
            self.events.emit(KernelEvent::RateLimited {
                key: key.to_string(),
                source: decision.source,
            });
        }
        Ok(decision)
    }

    /// True while decisions come from local windows.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.load_full()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Swap key prefix, strategy and timeouts. The breaker and local caps keep their settings.
    pub fn set_config(&self, config: RateLimitConfig) {
        self.config.store(Arc::new(config));
    }

    /// Forget local windows, e.g. at shutdown.
    pub fn clear_fallback(&self) {
        self.local.clear();
    }

    async fn shared_check(&self, key: &str, max: u32, window: Duration) -> Result<RateDecision, CallError<StoreError>> {
        let config = self.config.load_full();
        let store_key = format!("{}{}", config.key_prefix, key);
        let (store_key, config) = (&store_key, &config);
        self.breaker
            .execute(|| async move {
                let round_trip = self.round_trip(store_key, max, window, config.strategy);
                match with_deadline(config.store_timeout(), round_trip).await {
                    Ok(result) => result,
                    Err(limit) => Err(StoreError::Timeout(limit)),
                }
            })
            .await
    }

    async fn round_trip(
        &self,
        store_key: &str,
        max: u32,
        window: Duration,
        strategy: RateLimitStrategy,
    ) -> Result<RateDecision, StoreError> {
        match strategy {
            RateLimitStrategy::Sliding => {
                let script = Script::SlidingWindow {
                    key: store_key.to_string(),
                    window,
                    max,
                    member: Uuid::new_v4().to_string(),
                };
                let reply = self.store.run(script).await?.into_window()?;
                Ok(RateDecision::from_window(
                    reply.allowed,
                    reply.count,
                    max,
                    reply.oldest_age,
                    window,
                    DecisionSource::Shared,
                ))
            }
            RateLimitStrategy::Fixed => {
                let counter = self.store.incr_with_expiry(store_key, window).await?;
                let allowed = counter.value <= u64::from(max);
                if allowed {
                    let count = u32::try_from(counter.value).unwrap_or(u32::MAX);
                    Ok(RateDecision::from_window(true, count, max, None, window, DecisionSource::Shared))
                } else {
                    let wait = counter.expires_in.unwrap_or(window);
                    Ok(RateDecision::denied(max, wait, window, DecisionSource::Shared))
                }
            }
        }
    }

    fn degrade(&self, err: &CallError<StoreError>) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(error = %err, "Rate limit store unavailable, answering from local windows");
            self.events.emit(KernelEvent::RateLimiterDegraded { degraded: true });
        }
    }

    fn recovered(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(keys = self.local.len(), "Rate limit store recovered, discarding local windows");
            self.local.clear();
            self.events.emit(KernelEvent::RateLimiterDegraded { degraded: false });
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("degraded", &self.is_degraded())
            .field("local_keys", &self.local.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use crate::store::MemoryStore;

    fn limiter(store: Arc<MemoryStore>, config: RateLimitConfig) -> RateLimiter {
        let registry = CircuitRegistry::new(CircuitConfig::default(), EventBus::default());
        RateLimiter::new(store, config, &registry, EventBus::default())
    }

    #[tokio::test]
    async fn test_fourth_request_denied() {
        let limiter = limiter(Arc::new(MemoryStore::new()), RateLimitConfig::default());
        let window = Duration::from_secs(60);
        for expected_remaining in [2, 1, 0] {
            let d = limiter.check("client-a", 3, window).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
            assert_eq!(d.source, DecisionSource::Shared);
        }
        let denied = limiter.check("client-a", 3, window).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs > 0 && denied.retry_after_secs <= 60);

        // Other keys are unaffected.
        assert!(limiter.check("client-b", 3, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_max_denies_without_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), RateLimitConfig::default());
        let d = limiter.check("k", 0, Duration::from_secs(5)).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs, 5);
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_zero_window_is_client_error() {
        let limiter = limiter(Arc::new(MemoryStore::new()), RateLimitConfig::default());
        let err = limiter.check("k", 5, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Client);
    }

    #[tokio::test]
    async fn test_outage_falls_back_without_failing_open() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = limiter(store, RateLimitConfig::default());

        let mut allowed = 0;
        for _ in 0..10 {
            let d = limiter.check("k", 5, Duration::from_secs(60)).await.unwrap();
            assert_eq!(d.source, DecisionSource::Local);
            allowed += d.allowed as u32;
        }
        assert_eq!(allowed, 5);
        assert!(limiter.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_discards_local_state() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), RateLimitConfig::default());
        let window = Duration::from_secs(60);

        store.set_available(false);
        for _ in 0..3 {
            limiter.check("k", 3, window).await.unwrap();
        }
        assert!(!limiter.check("k", 3, window).await.unwrap().allowed);

        store.set_available(true);
        let reset = limiter.config().store_circuit.reset_timeout();
        tokio::time::advance(reset).await;

        let d = limiter.check("k", 3, window).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.source, DecisionSource::Shared);
        assert!(!limiter.is_degraded());
        assert!(limiter.local.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_strategy() {
        let config = RateLimitConfig {
            strategy: RateLimitStrategy::Fixed,
            ..Default::default()
        };
        let limiter = limiter(Arc::new(MemoryStore::new()), config);
        let window = Duration::from_secs(10);
        assert!(limiter.check("k", 2, window).await.unwrap().allowed);
        assert!(limiter.check("k", 2, window).await.unwrap().allowed);
        let denied = limiter.check("k", 2, window).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 10);

        tokio::time::advance(window).await;
        assert!(limiter.check("k", 2, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_wrong_type_answers_locally() {
        let store = Arc::new(MemoryStore::new());
        store.incr_with_expiry("ratelimit:k", Duration::from_secs(60)).await.unwrap();
        let limiter = limiter(store, RateLimitConfig::default());
        let d = limiter.check("k", 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(d.source, DecisionSource::Local);
        // Not a dependency failure.
        assert_eq!(limiter.breaker().snapshot().failures, 0);
    }
}
