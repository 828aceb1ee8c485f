//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, ratios within bounds)
//! - Check addresses that will be bound at startup
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: KernelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{CircuitConfig, KernelConfig};
use crate::resilience::timeouts::deadline_from_ms;

/// A single semantic problem in a config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

pub fn validate_config(config: &KernelConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_circuit("circuit", &config.circuit, &mut errors);
    check_circuit("rate_limit.store_circuit", &config.rate_limit.store_circuit, &mut errors);

    let retry = &config.retry;
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(ValidationError::new("retry.max_delay_ms", "must be >= base_delay_ms"));
    }
    if !(0.0..=1.0).contains(&retry.jitter_ratio) {
        errors.push(ValidationError::new("retry.jitter_ratio", "must be within 0.0..=1.0"));
    }
    if retry.budget_enabled {
        if !(0.0..=1.0).contains(&retry.budget_ratio) {
            errors.push(ValidationError::new("retry.budget_ratio", "must be within 0.0..=1.0"));
        }
        if retry.budget_window_ms == 0 {
            errors.push(ValidationError::new("retry.budget_window_ms", "must be > 0"));
        }
    }

    if config.circuit.call_timeout().is_none() && deadline_from_ms(retry.attempt_timeout_ms).is_none() {
        errors.push(ValidationError::new(
            "circuit.call_timeout_ms",
            "dependency calls need a deadline; set this or retry.attempt_timeout_ms",
        ));
    }

    let lock = &config.lock;
    if lock.default_ttl_ms == 0 {
        errors.push(ValidationError::new("lock.default_ttl_ms", "must be > 0"));
    }
    if lock.store_timeout_ms == 0 {
        errors.push(ValidationError::new("lock.store_timeout_ms", "must be > 0"));
    }

    let rate = &config.rate_limit;
    if rate.store_timeout_ms == 0 {
        errors.push(ValidationError::new("rate_limit.store_timeout_ms", "must be > 0"));
    }
    if rate.fallback_max_keys == 0 {
        errors.push(ValidationError::new("rate_limit.fallback_max_keys", "must be > 0"));
    }
    if rate.fallback_sweep_every == 0 {
        errors.push(ValidationError::new("rate_limit.fallback_sweep_every", "must be > 0"));
    }

    let dlq = &config.dead_letter;
    if dlq.capacity == 0 {
        errors.push(ValidationError::new("dead_letter.capacity", "must be > 0"));
    }
    if dlq.max_page == 0 {
        errors.push(ValidationError::new("dead_letter.max_page", "must be > 0"));
    }

    let obs = &config.observability;
    if obs.event_buffer == 0 {
        errors.push(ValidationError::new("observability.event_buffer", "must be > 0"));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", obs.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_circuit(section: &str, circuit: &CircuitConfig, errors: &mut Vec<ValidationError>) {
    if circuit.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{section}.failure_threshold"), "must be > 0"));
    }
    if circuit.half_open_max_calls == 0 {
        errors.push(ValidationError::new(format!("{section}.half_open_max_calls"), "must be > 0"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&KernelConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = KernelConfig::default();
        config.circuit.failure_threshold = 0;
        config.dead_letter.capacity = 0;
        config.retry.base_delay_ms = 500;
        config.retry.max_delay_ms = 100;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["circuit.failure_threshold", "retry.max_delay_ms", "dead_letter.capacity"]
        );
    }

    #[test]
    fn test_calls_without_any_deadline_rejected() {
        let mut config = KernelConfig::default();
        config.circuit.call_timeout_ms = Some(0);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "circuit.call_timeout_ms");

        config.retry.attempt_timeout_ms = Some(500);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_metrics_address_checked_only_when_enabled() {
        let mut config = KernelConfig::default();
        config.observability.metrics_address = "nowhere".to_string();
        assert!(validate_config(&config).is_ok());
        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
