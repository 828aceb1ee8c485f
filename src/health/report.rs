//! Kernel health report.

use serde::Serialize;

use crate::resilience::circuit_breaker::{CircuitSnapshot, CircuitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub circuits: Vec<CircuitSnapshot>,
    pub rate_limiter_degraded: bool,
    /// `None` if the dead-letter store could not be read.
    pub dead_letter_depth: Option<usize>,
}

impl HealthReport {
    pub fn new(circuits: Vec<CircuitSnapshot>, rate_limiter_degraded: bool, dead_letter_depth: Option<usize>) -> Self {
        let tripped = circuits.iter().any(|c| c.state != CircuitState::Closed);
        let status = if tripped || rate_limiter_degraded || dead_letter_depth.is_none() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            circuits,
            rate_limiter_degraded,
            dead_letter_depth,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Names of circuits that are not closed.
    pub fn tripped_circuits(&self) -> impl Iterator<Item = &str> {
        self.circuits
            .iter()
            .filter(|c| c.state != CircuitState::Closed)
            .map(|c| c.name.as_str())
    }
}
