//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define kernel metrics (circuit transitions, contention, rejections, dead letters)
//! - Optionally expose a Prometheus-compatible endpoint
//!
//! # Metrics
//! - `kernel_circuit_transitions_total` (counter): by circuit, target state
//! - `kernel_lock_contention_total` (counter): failed acquisitions
//! - `kernel_lock_lost_total` (counter): releases that found another holder
//! - `kernel_rate_limited_total` (counter): rejections by decision source
//! - `kernel_rate_limiter_degraded` (gauge): 1 while answering locally
//! - `kernel_dead_letter_enqueued_total` (counter): by queue
//! - `kernel_dead_letter_evicted_total` (counter): by queue
//! - `kernel_dead_letter_dropped_total` (counter): by reason
//! - `kernel_dead_letter_depth` (gauge)
//!
//! # Design Decisions
//! - Low-overhead updates through the `metrics` facade; no recorder means no-op
//! - Lock resources and rate-limit keys are not used as labels (unbounded cardinality)

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::observability::events::KernelEvent;

/// Install the Prometheus recorder with an HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Mirror a kernel event into metrics.
pub fn record_event(event: &KernelEvent) {
    match event {
        KernelEvent::CircuitTransition { circuit, to, .. } => {
            counter!(
                "kernel_circuit_transitions_total",
                "circuit" => circuit.clone(),
                "to" => to.as_str()
            )
            .increment(1);
        }
        KernelEvent::LockContended { .. } => {
            counter!("kernel_lock_contention_total").increment(1);
        }
        KernelEvent::LockLost { .. } => {
            counter!("kernel_lock_lost_total").increment(1);
        }
        KernelEvent::RateLimited { source, .. } => {
            counter!("kernel_rate_limited_total", "source" => source.as_str()).increment(1);
        }
        KernelEvent::RateLimiterDegraded { degraded } => {
            gauge!("kernel_rate_limiter_degraded").set(if *degraded { 1.0 } else { 0.0 });
        }
        KernelEvent::DeadLetterEnqueued { queue, depth } => {
            counter!("kernel_dead_letter_enqueued_total", "queue" => queue.clone()).increment(1);
            record_dead_letter_depth(*depth);
        }
        KernelEvent::DeadLetterEvicted { queue } => {
            counter!("kernel_dead_letter_evicted_total", "queue" => queue.clone()).increment(1);
        }
        KernelEvent::DeadLetterDropped { reason, .. } => {
            counter!("kernel_dead_letter_dropped_total", "reason" => reason.clone()).increment(1);
        }
    }
}

/// Record the current dead-letter depth.
pub fn record_dead_letter_depth(depth: usize) {
    gauge!("kernel_dead_letter_depth").set(depth as f64);
}
