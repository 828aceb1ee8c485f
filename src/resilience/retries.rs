//! Retry logic.
//!
//! # Responsibilities
//! - Classify each failed attempt as retryable or terminal
//! - Execute retries with exponential backoff + jitter
//! - Enforce retry budget (max retries per time window)
//! - Stop as soon as the protecting circuit opens
//!
//! # Design Decisions
//! - Client and unavailable errors return immediately, consuming no budget
//! - Jittered backoff prevents thundering herd
//! - Retry budget prevents retry storms under load
//! - Backoff sleeps race a cancellation token; nothing is left scheduled on return

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::resilience::backoff::Backoff;
use crate::resilience::circuit_breaker::{CallError, CircuitBreaker, CircuitRejection};
use crate::resilience::classify::{Classify, ErrorClass};
use crate::resilience::timeouts::{deadline_from_ms, with_deadline};

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Deadline for each attempt, breaker included.
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self { max_retries, backoff, attempt_timeout: None }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(config.base_delay_ms),
                max: Duration::from_millis(config.max_delay_ms),
                jitter_ratio: config.jitter_ratio,
            },
            attempt_timeout: deadline_from_ms(config.attempt_timeout_ms),
        }
    }
}

/// Caps retries to a fraction of requests within a rolling window.
#[derive(Debug)]
pub struct RetryBudget {
    ratio: f32,
    min_retries: u64,
    window: Duration,
    state: Mutex<BudgetWindow>,
}

#[derive(Debug)]
struct BudgetWindow {
    started: Instant,
    requests: u64,
    retries: u64,
}

impl RetryBudget {
    /// Allow `max(min_retries, requests * ratio)` retries per `window`.
    pub fn new(ratio: f32, min_retries: u64, window: Duration) -> Self {
        Self {
            ratio,
            min_retries,
            window,
            state: Mutex::new(BudgetWindow {
                started: Instant::now(),
                requests: 0,
                retries: 0,
            }),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.budget_ratio,
            config.budget_min_retries,
            Duration::from_millis(config.budget_window_ms),
        )
    }

    pub fn record_request(&self) {
        let mut state = self.state.lock();
        self.roll(&mut state);
        state.requests += 1;
    }

    /// Take one retry from the budget.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.roll(&mut state);
        let allowed = ((state.requests as f64 * self.ratio as f64) as u64).max(self.min_retries);
        if state.retries < allowed {
            state.retries += 1;
            true
        } else {
            false
        }
    }

    fn roll(&self, state: &mut BudgetWindow) {
        if state.started.elapsed() >= self.window {
            state.started = Instant::now();
            state.requests = 0;
            state.retries = 0;
        }
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure after {attempts} attempt(s): {error}")]
    NonRetryable { attempts: u32, error: E },

    #[error("dependency unavailable after {attempts} attempt(s): {rejection}")]
    Unavailable { attempts: u32, rejection: CircuitRejection },

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: CallError<E> },

    #[error("retries cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempts, .. }
            | RetryError::Unavailable { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// True when a breaker refused the call; callers may fall back right away.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RetryError::Unavailable { .. })
    }

    /// The operation's last own error, if any.
    pub fn into_error(self) -> Option<E> {
        match self {
            RetryError::NonRetryable { error, .. } => Some(error),
            RetryError::Exhausted { last, .. } => last.into_failed(),
            _ => None,
        }
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            RetryError::NonRetryable { error, .. } => error.class(),
            RetryError::Unavailable { .. } | RetryError::Cancelled { .. } => ErrorClass::Unavailable,
            RetryError::Exhausted { .. } => ErrorClass::Transient,
        }
    }
}

/// Runs operations with retry, optionally behind a circuit breaker.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    budget: Option<Arc<RetryBudget>>,
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
            budget: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Abort backoff waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        self.run_classified(op, |err: &E| err.class()).await
    }

    pub async fn run_classified<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        if let Some(budget) = &self.budget {
            budget.record_request();
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            // The breaker owns the attempt deadline so a timeout is counted.
            let outcome = match &self.breaker {
                Some(breaker) => {
                    breaker
                        .execute_within(&mut op, &classify, self.policy.attempt_timeout)
                        .await
                }
                None => match with_deadline(self.policy.attempt_timeout, op()).await {
                    Ok(result) => result.map_err(CallError::Failed),
                    Err(limit) => Err(CallError::TimedOut(limit)),
                },
            };
            let err = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(attempts, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let err = match err {
                CallError::Rejected(rejection) => {
                    return Err(RetryError::Unavailable { attempts, rejection })
                }
                CallError::Failed(error) if !classify(&error).is_retryable() => {
                    return Err(RetryError::NonRetryable { attempts, error })
                }
                retryable => retryable,
            };

            if let Some(rejection) = self.breaker.as_ref().and_then(|b| b.open_rejection()) {
                tracing::warn!(
                    circuit = rejection.circuit(),
                    attempts,
                    "Circuit opened mid-sequence, abandoning retries"
                );
                return Err(RetryError::Unavailable { attempts, rejection });
            }

            if attempts > self.policy.max_retries {
                tracing::warn!(attempts, "Retries exhausted");
                return Err(RetryError::Exhausted { attempts, last: err });
            }

            if let Some(budget) = &self.budget {
                if !budget.try_acquire() {
                    tracing::warn!(attempts, "Retry budget exhausted");
                    return Err(RetryError::Exhausted { attempts, last: err });
                }
            }

            let delay = self.policy.backoff.delay(attempts);
            tracing::info!(attempt = attempts, delay = ?delay, "Retrying after transient failure");
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(RetryError::Cancelled { attempts });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if self.cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }
        }
    }
}

/// Retry `op` under `policy` without a circuit breaker.
pub async fn with_retry<T, E, F, Fut>(op: F, policy: &RetryPolicy) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    RetryExecutor::new(policy.clone()).run(op).await
}
