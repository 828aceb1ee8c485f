//! Proof of lock ownership.

use std::time::Duration;

use tokio::time::Instant;

/// A held lock on one resource.
///
/// Only the holder knows `value`; release and extension compare against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    resource: String,
    /// Store key the lock was taken under; release and extend reuse it.
    key: String,
    value: String,
    fencing_token: u64,
    ttl: Duration,
    acquired_at: Instant,
    expires_at: Instant,
}

impl LockHandle {
    pub(crate) fn new(resource: &str, key: String, value: String, fencing_token: u64, ttl: Duration) -> Self {
        let acquired_at = Instant::now();
        Self {
            resource: resource.to_string(),
            key,
            value,
            fencing_token,
            ttl,
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Strictly increasing per resource; pass it along with every guarded write.
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Local estimate of when the store expires the lock.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub(crate) fn renewed(&mut self, ttl: Duration) {
        self.ttl = ttl;
        self.expires_at = Instant::now() + ttl;
    }
}
