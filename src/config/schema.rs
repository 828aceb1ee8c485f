//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the kernel.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::timeouts::deadline_from_ms;

/// Root configuration for the kernel.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// Defaults for circuit breakers created through the registry.
    pub circuit: CircuitConfig,

    /// Retry policy and budget.
    pub retry: RetryConfig,

    /// Distributed lock settings.
    pub lock: LockConfig,

    /// Admission control settings.
    pub rate_limit: RateLimitConfig,

    /// Dead-letter sink settings.
    pub dead_letter: DeadLetterConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive countable failures that open the circuit.
    pub failure_threshold: u32,

    /// Cooldown before a probe is admitted, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Concurrent probes while half-open.
    pub half_open_max_calls: u32,

    /// Per-call deadline in milliseconds. 0 disables it, which is only
    /// accepted when `retry.attempt_timeout_ms` is set.
    pub call_timeout_ms: Option<u64>,
}

impl CircuitConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        deadline_from_ms(self.call_timeout_ms)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 1,
            call_timeout_ms: Some(10_000),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Jitter added on top of each delay, as a fraction of it.
    pub jitter_ratio: f64,

    /// Deadline for each attempt in milliseconds.
    pub attempt_timeout_ms: Option<u64>,

    /// Cap retries to a share of requests.
    pub budget_enabled: bool,

    /// Percentage of requests that can be retries (retry budget).
    /// e.g., 0.1 for 10% budget.
    pub budget_ratio: f32,

    /// Retries always allowed per window regardless of the ratio.
    pub budget_min_retries: u64,

    /// Budget accounting window in milliseconds.
    pub budget_window_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            jitter_ratio: 0.1,
            attempt_timeout_ms: None,
            budget_enabled: false,
            budget_ratio: 0.1,
            budget_min_retries: 10,
            budget_window_ms: 10_000,
        }
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// Prefix for `lock:` and `fence:` keys.
    pub key_prefix: String,

    /// TTL used by `with_lock` when none is given, in milliseconds.
    pub default_ttl_ms: u64,

    /// Additional acquire attempts in `with_lock`.
    pub retry_count: u32,

    /// Delay between acquire attempts in milliseconds.
    pub retry_delay_ms: u64,

    /// Deadline for each store round trip in milliseconds.
    pub store_timeout_ms: u64,
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        deadline_from_ms(Some(self.store_timeout_ms))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            default_ttl_ms: 30_000,
            retry_count: 3,
            retry_delay_ms: 200,
            store_timeout_ms: 2000,
        }
    }
}

/// Counting strategy for the shared-store path.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Exact log of admissions within the trailing window.
    #[default]
    Sliding,
    /// One counter per window, reset when it expires.
    Fixed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Prefix for rate limit keys in the shared store.
    pub key_prefix: String,

    pub strategy: RateLimitStrategy,

    /// Deadline for each store round trip in milliseconds.
    pub store_timeout_ms: u64,

    /// Breaker guarding the store path.
    pub store_circuit: CircuitConfig,

    /// Maximum keys tracked by the local fallback.
    pub fallback_max_keys: usize,

    /// Sweep idle fallback keys every this many local checks.
    pub fallback_sweep_every: u64,
}

impl RateLimitConfig {
    pub fn store_timeout(&self) -> Option<Duration> {
        deadline_from_ms(Some(self.store_timeout_ms))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratelimit:".to_string(),
            strategy: RateLimitStrategy::Sliding,
            store_timeout_ms: 500,
            store_circuit: CircuitConfig {
                failure_threshold: 3,
                reset_timeout_ms: 5000,
                half_open_max_calls: 1,
                call_timeout_ms: Some(1_000),
            },
            fallback_max_keys: 10_000,
            fallback_sweep_every: 1024,
        }
    }
}

/// Dead-letter sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Entries kept before the oldest is evicted.
    pub capacity: usize,

    /// Largest page returned by `peek` and `peek_after`.
    pub max_page: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_page: 100,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Buffered events per subscriber before the slowest one lags.
    pub event_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
            event_buffer: 256,
        }
    }
}
