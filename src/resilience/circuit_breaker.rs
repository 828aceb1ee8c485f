//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: one probe call tests whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive countable failures >= threshold
//! Open → Half-Open: after the reset timeout, on the next call
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open: probe fails, times out or is abandoned
//! ```
//!
//! # Design Decisions
//! - Per-resource breaker, state local to the process
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open; concurrent callers are rejected, not queued
//! - Outcomes are re-validated against the current state before committing

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::observability::{EventBus, KernelEvent};
use crate::resilience::classify::{Classify, ErrorClass};
use crate::resilience::timeouts::with_deadline;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call was refused without running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitRejection {
    #[error("circuit '{name}' is open; retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error("circuit '{name}' is half-open and its probe is still in flight")]
    ProbeInProgress { name: String },
}

impl CircuitRejection {
    pub fn circuit(&self) -> &str {
        match self {
            CircuitRejection::Open { name, .. } | CircuitRejection::ProbeInProgress { name } => name,
        }
    }
}

/// Error of a protected call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("{0}")]
    Rejected(CircuitRejection),

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }

    /// The operation's own error, if it got that far.
    pub fn into_failed(self) -> Option<E> {
        match self {
            CallError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for CallError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            CallError::Rejected(_) => ErrorClass::Unavailable,
            CallError::TimedOut(_) => ErrorClass::Transient,
            CallError::Failed(err) => err.class(),
        }
    }
}

/// Point-in-time view of a breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    /// Remaining cooldown while open.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probes_in_flight: u32,
    /// Bumped on every half-open entry and manual reset to discard stale probe outcomes.
    generation: u64,
}

enum Permit {
    Normal,
    Probe { generation: u64 },
}

/// Settles a probe as failed if its call never completes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl ProbeGuard<'_> {
    fn settle(mut self, recovered: bool) {
        self.settled = true;
        self.breaker.settle_probe(self.generation, recovered);
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(circuit = %self.breaker.name, "Probe abandoned before completion");
            self.breaker.settle_probe(self.generation, false);
        }
    }
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, events: EventBus) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probes_in_flight: 0,
                generation: 0,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `op` through the breaker using the error's own classification.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.execute_classified(op, |err: &E| err.class()).await
    }

    /// Run `op` through the breaker; `classify` decides which errors count.
    pub async fn execute_classified<T, E, F, Fut, C>(&self, op: F, classify: C) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        self.execute_within(op, classify, None).await
    }

    /// Like [`CircuitBreaker::execute_classified`], bounded by `limit` as well as
    /// the configured call timeout. Whichever is shorter applies, and expiry
    /// counts as a failure.
    pub async fn execute_within<T, E, F, Fut, C>(
        &self,
        op: F,
        classify: C,
        limit: Option<Duration>,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let deadline = match (self.config.call_timeout(), limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let permit = self.admit().map_err(CallError::Rejected)?;
        let probe = match permit {
            Permit::Probe { generation } => Some(ProbeGuard {
                breaker: self,
                generation,
                settled: false,
            }),
            Permit::Normal => None,
        };

        let result = match with_deadline(deadline, op()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CallError::Failed(err)),
            Err(limit) => Err(CallError::TimedOut(limit)),
        };

        let countable = match &result {
            Ok(_) => false,
            Err(CallError::TimedOut(_)) => true,
            Err(CallError::Failed(err)) => classify(err).counts_toward_circuit(),
            Err(CallError::Rejected(_)) => false,
        };

        match probe {
            // A client error still proves the dependency answered.
            Some(guard) => guard.settle(!countable),
            None if countable => self.record_failure(),
            None if result.is_ok() => self.record_success(),
            None => {}
        }
        result
    }

    /// Rejection a caller would get right now, if the breaker is cooling down.
    pub fn open_rejection(&self) -> Option<CircuitRejection> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(&inner);
                (!remaining.is_zero()).then(|| CircuitRejection::Open {
                    name: self.name.clone(),
                    retry_after: remaining,
                })
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let retry_after_ms = match inner.state {
            CircuitState::Open => Some(self.remaining_cooldown(&inner).as_millis() as u64),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            retry_after_ms,
        }
    }

    /// Force the breaker closed and discard in-flight probe outcomes.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.failures = 0;
        inner.last_failure = None;
        inner.probes_in_flight = 0;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        tracing::info!(circuit = %self.name, "Circuit manually reset");
    }

    fn admit(&self) -> Result<Permit, CircuitRejection> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(&inner);
                if !remaining.is_zero() {
                    return Err(CircuitRejection::Open {
                        name: self.name.clone(),
                        retry_after: remaining,
                    });
                }
                inner.generation += 1;
                inner.probes_in_flight = 1;
                self.transition(&mut inner, CircuitState::HalfOpen);
                Ok(Permit::Probe { generation: inner.generation })
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_calls.max(1) {
                    return Err(CircuitRejection::ProbeInProgress { name: self.name.clone() });
                }
                inner.probes_in_flight += 1;
                Ok(Permit::Probe { generation: inner.generation })
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        // A late success must not close a circuit another call opened.
        if inner.state == CircuitState::Closed {
            inner.failures = 0;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failures >= self.config.failure_threshold {
            tracing::warn!(
                circuit = %self.name,
                failures = inner.failures,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Failure threshold reached"
            );
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn settle_probe(&self, generation: u64, recovered: bool) {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.probes_in_flight = 0;
        if recovered {
            inner.failures = 0;
            inner.last_failure = None;
            self.transition(&mut inner, CircuitState::Closed);
        } else {
            inner.last_failure = Some(Instant::now());
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn remaining_cooldown(&self, inner: &Inner) -> Duration {
        let reset = self.config.reset_timeout();
        let elapsed = inner.last_failure.map_or(reset, |at| at.elapsed());
        reset.saturating_sub(elapsed)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => tracing::warn!(circuit = %self.name, %from, "Circuit opened"),
            CircuitState::HalfOpen => tracing::info!(circuit = %self.name, "Circuit half-open, admitting probe"),
            CircuitState::Closed => tracing::info!(circuit = %self.name, %from, "Circuit closed"),
        }
        self.events.emit(KernelEvent::CircuitTransition {
            circuit: self.name.clone(),
            from,
            to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Down,
        BadInput,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            match self {
                TestError::Down => ErrorClass::Transient,
                TestError::BadInput => ErrorClass::Client,
            }
        }
    }

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        let config = CircuitConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_max_calls: 1,
            call_timeout_ms: None,
        };
        CircuitBreaker::new("db", config, EventBus::default())
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CallError<TestError>> {
        cb.execute(|| async { Err::<(), _>(TestError::Down) }).await
    }

    #[tokio::test]
    async fn test_opens_on_threshold() {
        let cb = breaker(5, 1000);
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_never_invokes_op() {
        let cb = breaker(1, 60_000);
        let _ = fail(&cb).await;

        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let res = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                })
                .await;
            assert!(matches!(res, Err(CallError::Rejected(CircuitRejection::Open { .. }))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_count() {
        let cb = breaker(2, 1000);
        for _ in 0..10 {
            let _ = cb.execute(|| async { Err::<(), _>(TestError::BadInput) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = breaker(3, 1000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        cb.execute(|| async { Ok::<_, TestError>(()) }).await.unwrap();
        assert_eq!(cb.snapshot().failures, 0);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_under_concurrency() {
        let cb = breaker(1, 1000);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let probes = AtomicU32::new(0);
        let results = join_all((0..8).map(|_| {
            cb.execute(|| async {
                probes.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, TestError>(())
            })
        }))
        .await;

        assert_eq!(probes.load(Ordering::SeqCst), 1);
        let in_progress = results
            .iter()
            .filter(|r| matches!(r, Err(CallError::Rejected(CircuitRejection::ProbeInProgress { .. }))))
            .count();
        assert_eq!(in_progress, 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(1, 1000);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        let rejection = cb.open_rejection().unwrap();
        assert_eq!(rejection.circuit(), "db");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let config = CircuitConfig {
            failure_threshold: 1,
            reset_timeout_ms: 1000,
            half_open_max_calls: 1,
            call_timeout_ms: Some(50),
        };
        let cb = CircuitBreaker::new("slow", config, EventBus::default());
        let res = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, TestError>(())
            })
            .await;
        assert!(matches!(res, Err(CallError::TimedOut(_))));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_reopens() {
        let cb = breaker(1, 1000);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let probe = cb.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, TestError>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(5), probe).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_closes_and_emits() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let cb = CircuitBreaker::new("db", CircuitConfig { failure_threshold: 1, ..Default::default() }, events);
        let _ = fail(&cb).await;
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);

        let opened = rx.recv().await.unwrap();
        assert!(matches!(opened, KernelEvent::CircuitTransition { to: CircuitState::Open, .. }));
        let closed = rx.recv().await.unwrap();
        assert!(matches!(closed, KernelEvent::CircuitTransition { to: CircuitState::Closed, .. }));
    }
}
