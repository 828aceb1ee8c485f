//! Compare-and-swap emulation of the atomic store contract.
//!
//! # Responsibilities
//! - Run every [`AtomicStore`] operation against a store that only offers
//!   versioned reads and conditional commits
//! - Retry on version conflicts up to a bound
//!
//! # Design Decisions
//! - A commit succeeds only if every key read still has the version seen,
//!   so no observer ever sees a half-applied script
//! - Outcomes that need no writes are returned without committing
//! - Conflicts past the bound surface as `StoreError::Contention`

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::script::{self, Plan, Script, ScriptReply};
use super::{AtomicStore, Cell, Counter, StoreError, StoredValue};

/// A live value with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub cell: Cell,
}

/// A write inside a [`CasTxn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasWrite {
    Put {
        key: String,
        value: StoredValue,
        /// `None` persists the value without expiry.
        ttl: Option<Duration>,
    },
    Delete { key: String },
}

impl CasWrite {
    pub fn put(key: impl Into<String>, value: StoredValue, ttl: Option<Duration>) -> Self {
        CasWrite::Put { key: key.into(), value, ttl }
    }
}

/// Conditional transaction: apply `writes` only if every guard still holds.
///
/// A guard of `None` requires the key to be absent.
#[derive(Debug, Clone, Default)]
pub struct CasTxn {
    pub guards: Vec<(String, Option<u64>)>,
    pub writes: Vec<CasWrite>,
}

/// Minimal contract of a store without server-side scripting.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Read a live key and its version.
    async fn load(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Apply a transaction; `Ok(false)` means a guard failed.
    async fn commit(&self, txn: CasTxn) -> Result<bool, StoreError>;
}

/// Adapts a [`VersionedStore`] into an [`AtomicStore`].
pub struct CasStore<S> {
    inner: S,
    max_attempts: u32,
}

impl<S: VersionedStore> CasStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, max_attempts: 16 }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn transact<R, F>(&self, keys: &[&str], plan: F) -> Result<R, StoreError>
    where
        F: Fn(script::Reader<'_>, Instant) -> Result<Plan<R>, StoreError> + Send + Sync,
        R: Send,
    {
        for attempt in 1..=self.max_attempts {
            let mut seen: Vec<(String, Option<Versioned>)> = Vec::with_capacity(keys.len());
            for key in keys {
                seen.push((key.to_string(), self.inner.load(key).await?));
            }

            let planned = {
                let read = |key: &str| {
                    seen.iter()
                        .find(|(k, _)| k == key)
                        .and_then(|(_, v)| v.as_ref().map(|v| v.cell.clone()))
                };
                plan(&read, Instant::now())?
            };

            if planned.writes.is_empty() {
                return Ok(planned.reply);
            }

            let txn = CasTxn {
                guards: seen
                    .into_iter()
                    .map(|(key, v)| (key, v.map(|v| v.version)))
                    .collect(),
                writes: planned.writes,
            };
            if self.inner.commit(txn).await? {
                return Ok(planned.reply);
            }
            tracing::debug!(keys = ?keys, attempt, "CAS conflict, retrying");
        }

        Err(StoreError::Contention {
            key: keys.join(","),
            attempts: self.max_attempts,
        })
    }
}

#[async_trait]
impl<S: VersionedStore> AtomicStore for CasStore<S> {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.transact(&[key], |read, _| Ok(script::plan_set_if_absent(read, key, value, ttl)))
            .await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.transact(&[key], |read, _| Ok(script::plan_delete_if_equals(read, key, value)))
            .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<Counter, StoreError> {
        self.transact(&[key], |read, _| script::plan_incr_with_expiry(read, key, ttl))
            .await
    }

    async fn run(&self, script: Script) -> Result<ScriptReply, StoreError> {
        let keys = script.keys();
        self.transact(&keys, |read, now| script::plan_script(read, &script, now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cas_acquire_is_exclusive() {
        let store = CasStore::new(MemoryStore::new());
        let script = |value: &str| Script::AcquireFenced {
            lock_key: "lock:r".into(),
            fence_key: "fence:r".into(),
            value: value.into(),
            ttl: Duration::from_secs(10),
        };

        let first = store.run(script("a")).await.unwrap().into_fenced().unwrap();
        let second = store.run(script("b")).await.unwrap().into_fenced().unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(second, None);

        assert!(store.delete_if_equals("lock:r", "a").await.unwrap());
        let third = store.run(script("b")).await.unwrap().into_fenced().unwrap();
        assert_eq!(third, Some(2));
    }

    #[tokio::test]
    async fn test_cas_counter_under_concurrency() {
        let store = Arc::new(CasStore::new(MemoryStore::new()).with_max_attempts(64));
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.incr_with_expiry("hits", Duration::from_secs(60)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let last = store.incr_with_expiry("hits", Duration::from_secs(60)).await.unwrap();
        assert_eq!(last.value, 21);
    }

    #[tokio::test]
    async fn test_stale_guard_rejected() {
        let store = MemoryStore::new();
        assert!(store.commit(CasTxn {
            guards: vec![("k".into(), None)],
            writes: vec![CasWrite::put("k", StoredValue::Counter(1), None)],
        })
        .await
        .unwrap());

        // The key now exists, so an "absent" guard must fail.
        let applied = store
            .commit(CasTxn {
                guards: vec![("k".into(), None)],
                writes: vec![CasWrite::put("k", StoredValue::Counter(9), None)],
            })
            .await
            .unwrap();
        assert!(!applied);
        let current = store.load("k").await.unwrap().unwrap();
        assert_eq!(current.cell.value, StoredValue::Counter(1));
    }
}
