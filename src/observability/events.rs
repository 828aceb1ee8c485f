//! State-change events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::admission::DecisionSource;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitState;

/// A state change worth telling a monitoring collaborator about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    CircuitTransition {
        circuit: String,
        from: CircuitState,
        to: CircuitState,
    },
    LockContended {
        resource: String,
    },
    /// Release found another value under the key: the lock had expired.
    LockLost {
        resource: String,
        fencing_token: u64,
    },
    RateLimited {
        key: String,
        source: DecisionSource,
    },
    RateLimiterDegraded {
        degraded: bool,
    },
    DeadLetterEnqueued {
        queue: String,
        depth: usize,
    },
    DeadLetterEvicted {
        queue: String,
    },
    DeadLetterDropped {
        queue: String,
        reason: String,
    },
}

/// Broadcast bus shared by all components of one kernel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KernelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.tx.subscribe()
    }

    /// Record metrics for `event` and broadcast it.
    ///
    /// Having no subscribers is not an error.
    pub fn emit(&self, event: KernelEvent) {
        metrics::record_event(&event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
