//! Per-process sliding windows used while the shared store is unreachable.
//!
//! # Design Decisions
//! - Exact timestamp log per key, bounded by the key's limit, so the
//!   fallback never admits more than the shared path would
//! - Idle keys are swept periodically; the number of keys is capped
//! - A new key arriving at the cap evicts the key idle the longest, so a
//!   first request is always admitted

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::admission::decision::{DecisionSource, RateDecision};

#[derive(Debug)]
struct LocalWindow {
    hits: VecDeque<Instant>,
    window: Duration,
}

impl LocalWindow {
    fn prune(&mut self, now: Instant) {
        while self
            .hits
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= self.window)
        {
            self.hits.pop_front();
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.hits
            .back()
            .map_or(true, |at| now.saturating_duration_since(*at) >= self.window)
    }
}

#[derive(Debug)]
pub struct LocalWindows {
    windows: DashMap<String, LocalWindow>,
    max_keys: usize,
    sweep_every: u64,
    checks: AtomicU64,
}

impl LocalWindows {
    pub fn new(max_keys: usize, sweep_every: u64) -> Self {
        Self {
            windows: DashMap::new(),
            max_keys: max_keys.max(1),
            sweep_every: sweep_every.max(1),
            checks: AtomicU64::new(0),
        }
    }

    pub fn check(&self, key: &str, max: u32, window: Duration) -> RateDecision {
        let now = Instant::now();
        if self.checks.fetch_add(1, Ordering::Relaxed) % self.sweep_every == self.sweep_every - 1 {
            self.sweep(now);
        }

        if !self.windows.contains_key(key) && self.windows.len() >= self.max_keys {
            self.sweep(now);
            if self.windows.len() >= self.max_keys {
                self.evict_least_recent();
            }
        }

        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| LocalWindow {
            hits: VecDeque::new(),
            window,
        });
        let local = entry.value_mut();
        local.window = window;
        local.prune(now);

        let allowed = local.hits.len() < max as usize;
        if allowed {
            local.hits.push_back(now);
        }
        let count = u32::try_from(local.hits.len()).unwrap_or(u32::MAX);
        let oldest_age = local.hits.front().map(|at| now.saturating_duration_since(*at));
        RateDecision::from_window(allowed, count, max, oldest_age, window, DecisionSource::Local)
    }

    /// Drop keys with no admissions inside their window.
    pub fn sweep(&self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.is_idle(now));
        let swept = before.saturating_sub(self.windows.len());
        if swept > 0 {
            tracing::debug!(swept, "Swept idle local rate windows");
        }
    }

    fn evict_least_recent(&self) {
        let victim = self
            .windows
            .iter()
            .min_by_key(|w| w.hits.back().copied())
            .map(|w| w.key().clone());
        if let Some(victim) = victim {
            tracing::warn!(evicted = %victim, max_keys = self.max_keys, "Local rate windows full, evicting least recent key");
            self.windows.remove(&victim);
        }
    }

    pub fn clear(&self) {
        self.windows.clear();
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
