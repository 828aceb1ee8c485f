//! Admission decisions.

use std::time::Duration;

use serde::Serialize;

/// Where a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// The shared store answered.
    Shared,
    /// This process answered on its own.
    Local,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Shared => "shared",
            DecisionSource::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    pub limit: u32,
    /// Whole seconds to wait before retrying; 0 when allowed.
    pub retry_after_secs: u64,
    pub source: DecisionSource,
}

impl RateDecision {
    /// Decision for a window holding `count` admissions, the oldest `oldest_age` ago.
    pub(crate) fn from_window(
        allowed: bool,
        count: u32,
        limit: u32,
        oldest_age: Option<Duration>,
        window: Duration,
        source: DecisionSource,
    ) -> Self {
        let retry_after_secs = if allowed {
            0
        } else {
            let wait = oldest_age.map_or(window, |age| window.saturating_sub(age));
            retry_after_secs(wait, window)
        };
        Self {
            allowed,
            remaining: limit.saturating_sub(count),
            limit,
            retry_after_secs,
            source,
        }
    }

    pub(crate) fn denied(limit: u32, wait: Duration, window: Duration, source: DecisionSource) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            retry_after_secs: retry_after_secs(wait, window),
            source,
        }
    }
}

/// Round `wait` up to whole seconds within `[1, window]`.
pub(crate) fn retry_after_secs(wait: Duration, window: Duration) -> u64 {
    let cap = ceil_secs(window).max(1);
    ceil_secs(wait).clamp(1, cap)
}

fn ceil_secs(d: Duration) -> u64 {
    (d.as_millis() as u64).div_ceil(1000)
}
