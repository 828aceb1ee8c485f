//! In-process shared store.
//!
//! # Responsibilities
//! - Provide a linearizable [`AtomicStore`] for single-host deployments and tests
//! - Expose the versioned [`VersionedStore`] contract for the CAS adapter
//! - Simulate outages and latency for failure-injection
//!
//! # Design Decisions
//! - One mutex guards the whole keyspace; every operation is one critical section
//! - Expiry is lazy: dead keys are ignored on read and swept on write once
//!   the map has doubled since the last sweep
//! - Every call counts as a round trip, including failed ones

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::cas::{CasTxn, CasWrite, Versioned, VersionedStore};
use super::script::{self, Plan, Script, ScriptReply};
use super::{AtomicStore, Cell, Counter, StoreError, StoredValue};

/// Sweep dead keys once the map grows past this many entries.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
    version: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn cell(&self, now: Instant) -> Cell {
        Cell {
            value: self.value.clone(),
            expires_in: self.expires_at.map(|at| at.saturating_duration_since(now)),
        }
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    next_version: u64,
    /// Size the map must exceed before the next sweep; doubles with the live set.
    sweep_at: usize,
    sweeps: u64,
}

impl Keyspace {
    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn apply(&mut self, writes: Vec<CasWrite>, now: Instant) {
        for write in writes {
            match write {
                CasWrite::Put { key, value, ttl } => {
                    self.next_version += 1;
                    self.entries.insert(
                        key,
                        Entry {
                            value,
                            expires_at: ttl.map(|ttl| now + ttl),
                            version: self.next_version,
                        },
                    );
                }
                CasWrite::Delete { key } => {
                    self.entries.remove(&key);
                }
            }
        }
        if self.entries.len() > self.sweep_at.max(SWEEP_THRESHOLD) {
            self.entries.retain(|_, e| e.is_live(now));
            self.sweep_at = self.entries.len().saturating_mul(2);
            self.sweeps += 1;
        }
    }
}

/// Linearizable in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
    round_trips: AtomicU64,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
            round_trips: AtomicU64::new(0),
            latency: Mutex::new(None),
        }
    }

    /// Toggle a simulated outage; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(available, "Memory store availability changed");
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Calls received so far, successful or not.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace.lock().entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full expiry sweeps run so far.
    pub fn sweeps(&self) -> u64 {
        self.keyspace.lock().sweeps
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    /// Plan and apply an operation inside one critical section.
    fn atomically<R, F>(&self, plan: F) -> Result<R, StoreError>
    where
        F: FnOnce(script::Reader<'_>, Instant) -> Result<Plan<R>, StoreError>,
    {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        let planned = {
            let view = &*keyspace;
            let read = |key: &str| view.live(key, now).map(|e| e.cell(now));
            plan(&read, now)?
        };
        keyspace.apply(planned.writes, now);
        Ok(planned.reply)
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.enter().await?;
        self.atomically(|read, _| Ok(script::plan_set_if_absent(read, key, value, ttl)))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.enter().await?;
        self.atomically(|read, _| Ok(script::plan_delete_if_equals(read, key, value)))
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<Counter, StoreError> {
        self.enter().await?;
        self.atomically(|read, _| script::plan_incr_with_expiry(read, key, ttl))
    }

    async fn run(&self, script: Script) -> Result<ScriptReply, StoreError> {
        self.enter().await?;
        self.atomically(|read, now| script::plan_script(read, &script, now))
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.enter().await?;
        let now = Instant::now();
        let keyspace = self.keyspace.lock();
        Ok(keyspace.live(key, now).map(|e| Versioned {
            version: e.version,
            cell: e.cell(now),
        }))
    }

    async fn commit(&self, txn: CasTxn) -> Result<bool, StoreError> {
        self.enter().await?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        let guards_hold = txn
            .guards
            .iter()
            .all(|(key, expected)| keyspace.live(key, now).map(|e| e.version) == *expected);
        if !guards_hold {
            return Ok(false);
        }
        keyspace.apply(txn.writes, now);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_ttl() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.set_if_absent("k", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals_only_matching() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "a", Duration::from_secs(5)).await.unwrap();
        assert!(!store.delete_if_equals("k", "b").await.unwrap());
        assert!(store.delete_if_equals("k", "a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_keeps_first_expiry() {
        let store = MemoryStore::new();
        let first = store.incr_with_expiry("c", Duration::from_secs(10)).await.unwrap();
        assert_eq!(first.value, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = store.incr_with_expiry("c", Duration::from_secs(10)).await.unwrap();
        assert_eq!(second.value, 2);
        assert_eq!(second.expires_in, Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = store.incr_with_expiry("c", Duration::from_secs(10)).await.unwrap();
        assert_eq!(fresh.value, 1);
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.round_trips(), 1);

        store.set_available(true);
        assert!(store.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_script_expires_members() {
        let store = MemoryStore::new();
        let script = || Script::SlidingWindow {
            key: "w".into(),
            window: Duration::from_secs(10),
            max: 1,
            member: uuid::Uuid::new_v4().to_string(),
        };
        assert!(store.run(script()).await.unwrap().into_window().unwrap().allowed);
        assert!(!store.run(script()).await.unwrap().into_window().unwrap().allowed);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.run(script()).await.unwrap().into_window().unwrap().allowed);
    }

    #[tokio::test]
    async fn test_sweep_waits_for_map_to_double() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(3600);
        for n in 0..=SWEEP_THRESHOLD {
            store.set_if_absent(&format!("fence:{n}"), "1", ttl).await.unwrap();
        }
        assert_eq!(store.sweeps(), 1);

        // Every key is live, so the next sweep waits until the map doubles.
        for n in 0..1000 {
            store.incr_with_expiry(&format!("rate:{n}"), ttl).await.unwrap();
        }
        assert_eq!(store.sweeps(), 1);
        assert_eq!(store.len(), SWEEP_THRESHOLD + 1001);
    }
}
