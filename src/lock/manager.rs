//! Distributed lock manager.
//!
//! # Responsibilities
//! - Acquire TTL-bounded locks with one atomic store round trip
//! - Issue a fencing token per successful acquisition
//! - Release and extend only while still the holder
//! - Run work under a lock and always release it afterwards
//!
//! # Design Decisions
//! - Contention is `Ok(None)`, never an error
//! - Store failures and store timeouts surface as `LockError::StoreUnavailable`
//! - Release on drop is spawned; the TTL is the backstop if no runtime is left
//! - The key prefix is fixed at construction; handles carry their own key

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::lock::handle::LockHandle;
use crate::observability::{EventBus, KernelEvent};
use crate::resilience::classify::{Classify, ErrorClass};
use crate::resilience::timeouts::with_deadline;
use crate::store::{AtomicStore, Script, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store unavailable for '{resource}': {source}")]
    StoreUnavailable {
        resource: String,
        #[source]
        source: StoreError,
    },

    #[error("could not acquire lock on '{resource}' after {attempts} attempt(s)")]
    NotAcquired { resource: String, attempts: u32 },

    #[error("work under lock '{resource}' exceeded {limit:?}")]
    DeadlineExceeded { resource: String, limit: Duration },

    #[error("lock ttl must be greater than zero")]
    InvalidTtl,

    #[error("waiting for lock '{resource}' was cancelled")]
    Cancelled { resource: String },
}

impl Classify for LockError {
    fn class(&self) -> ErrorClass {
        match self {
            LockError::StoreUnavailable { .. } | LockError::Cancelled { .. } => ErrorClass::Unavailable,
            LockError::NotAcquired { .. } | LockError::DeadlineExceeded { .. } => ErrorClass::Transient,
            LockError::InvalidTtl => ErrorClass::Client,
        }
    }
}

/// Per-call overrides for [`LockManager::with_lock`]; unset fields use the config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockOptions {
    pub ttl: Option<Duration>,
    pub retry_count: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Bound on the work itself. Defaults to the TTL.
    pub deadline: Option<Duration>,
}

impl LockOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = Some(count);
        self.retry_delay = Some(delay);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Issues and releases locks over a shared [`AtomicStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn AtomicStore>,
    prefix: Arc<str>,
    config: Arc<ArcSwap<LockConfig>>,
    events: EventBus,
    cancel: CancellationToken,
}

impl LockManager {
    pub fn new(store: Arc<dyn AtomicStore>, config: LockConfig, events: EventBus) -> Self {
        Self {
            store,
            prefix: Arc::from(config.key_prefix.as_str()),
            config: Arc::new(ArcSwap::from_pointee(config)),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort acquire retries when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Swap TTL, retry and timeout settings. The key prefix keeps its startup value.
    pub fn set_config(&self, config: LockConfig) {
        if config.key_prefix != *self.prefix {
            tracing::warn!(
                current = %self.prefix,
                requested = %config.key_prefix,
                "Lock key prefix changes apply after a restart"
            );
        }
        self.config.store(Arc::new(config));
    }

    pub fn config(&self) -> Arc<LockConfig> {
        self.config.load_full()
    }

    /// Try once to take the lock on `resource`.
    ///
    /// Returns `Ok(None)` if someone else holds it.
    pub async fn acquire_lock(&self, resource: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let value = Uuid::new_v4().to_string();
        let lock_key = self.lock_key(resource);
        let script = Script::AcquireFenced {
            lock_key: lock_key.clone(),
            fence_key: self.fence_key(resource),
            value: value.clone(),
            ttl,
        };
        let reply = self.round_trip(resource, self.store.run(script)).await?;
        let token = reply.into_fenced().map_err(|source| unavailable(resource, source))?;

        match token {
            Some(fencing_token) => {
                tracing::debug!(resource = %resource, fencing_token, ttl = ?ttl, "Lock acquired");
                Ok(Some(LockHandle::new(resource, lock_key, value, fencing_token, ttl)))
            }
            None => {
                tracing::debug!(resource = %resource, "Lock contended");
                self.events.emit(KernelEvent::LockContended { resource: resource.to_string() });
                Ok(None)
            }
        }
    }

    /// Release `handle`; `false` if the lock had already passed to someone else.
    pub async fn release_lock(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let released = self.delete_held(handle).await?;
        if !released {
            self.lost(handle);
        }
        Ok(released)
    }

    /// Push the expiry of a held lock to `ttl` from now.
    pub async fn extend_lock(&self, handle: &mut LockHandle, ttl: Duration) -> Result<bool, LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let resource = handle.resource().to_string();
        let script = Script::ExtendIfEquals {
            key: handle.key().to_string(),
            value: handle.value().to_string(),
            ttl,
        };
        let reply = self.round_trip(&resource, self.store.run(script)).await?;
        let extended = reply.into_flag().map_err(|source| unavailable(&resource, source))?;
        if extended {
            handle.renewed(ttl);
        } else {
            self.lost(handle);
        }
        Ok(extended)
    }

    /// Run `work` while holding the lock on `resource`.
    ///
    /// The lock is released afterwards whether `work` finishes, overruns its
    /// deadline, panics or is dropped.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, options: LockOptions, work: F) -> Result<T, LockError>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let config = self.config.load_full();
        let ttl = options.ttl.unwrap_or_else(|| config.default_ttl());
        let retry_count = options.retry_count.unwrap_or(config.retry_count);
        let retry_delay = options.retry_delay.unwrap_or_else(|| config.retry_delay());
        let deadline = options.deadline.unwrap_or(ttl);

        let mut attempts = 0;
        let handle = loop {
            if self.cancel.is_cancelled() {
                return Err(LockError::Cancelled { resource: resource.to_string() });
            }
            attempts += 1;
            if let Some(handle) = self.acquire_lock(resource, ttl).await? {
                break handle;
            }
            if attempts > retry_count {
                return Err(LockError::NotAcquired { resource: resource.to_string(), attempts });
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(LockError::Cancelled { resource: resource.to_string() });
                }
                _ = tokio::time::sleep(retry_delay) => {}
            }
        };

        let guard = ReleaseGuard {
            manager: self.clone(),
            handle: Some(handle.clone()),
        };
        let outcome = with_deadline(Some(deadline), work(handle)).await;
        guard.release().await;

        outcome.map_err(|limit| {
            tracing::warn!(resource = %resource, limit = ?limit, "Work under lock exceeded its deadline");
            LockError::DeadlineExceeded { resource: resource.to_string(), limit }
        })
    }

    async fn delete_held(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let resource = handle.resource();
        let released = self
            .round_trip(resource, self.store.delete_if_equals(handle.key(), handle.value()))
            .await?;
        if released {
            tracing::debug!(resource = %resource, fencing_token = handle.fencing_token(), "Lock released");
        }
        Ok(released)
    }

    fn lock_key(&self, resource: &str) -> String {
        format!("{}lock:{}", self.prefix, resource)
    }

    fn fence_key(&self, resource: &str) -> String {
        format!("{}fence:{}", self.prefix, resource)
    }

    fn lost(&self, handle: &LockHandle) {
        tracing::warn!(
            resource = %handle.resource(),
            fencing_token = handle.fencing_token(),
            "Lock lost: held by another owner or expired"
        );
        self.events.emit(KernelEvent::LockLost {
            resource: handle.resource().to_string(),
            fencing_token: handle.fencing_token(),
        });
    }

    async fn round_trip<T, Fut>(&self, resource: &str, call: Fut) -> Result<T, LockError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match with_deadline(self.config.load().store_timeout(), call).await {
            Ok(result) => result.map_err(|source| unavailable(resource, source)),
            Err(limit) => Err(unavailable(resource, StoreError::Timeout(limit))),
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("prefix", &self.prefix)
            .field("config", &self.config.load_full())
            .finish_non_exhaustive()
    }
}

fn unavailable(resource: &str, source: StoreError) -> LockError {
    tracing::warn!(resource = %resource, error = %source, "Lock store call failed");
    LockError::StoreUnavailable { resource: resource.to_string(), source }
}

/// Releases the lock when `with_lock` is left early.
struct ReleaseGuard {
    manager: LockManager,
    handle: Option<LockHandle>,
}

impl ReleaseGuard {
    async fn release(mut self) {
        if let Some(handle) = &self.handle {
            if let Err(e) = self.manager.release_lock(handle).await {
                tracing::warn!(resource = %handle.resource(), error = %e, "Release failed, lock will expire");
            }
        }
        // Cleared only once the release finished; dropping mid-release retries it.
        self.handle = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                runtime.spawn(async move {
                    // An interrupted release may already have deleted the key.
                    match manager.delete_held(&handle).await {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(resource = %handle.resource(), "Lock already released or expired"),
                        Err(e) => {
                            tracing::warn!(resource = %handle.resource(), error = %e, "Release failed, lock will expire")
                        }
                    }
                });
            }
            Err(_) => {
                tracing::warn!(resource = %handle.resource(), "No runtime to release lock, it will expire");
            }
        }
    }
}
