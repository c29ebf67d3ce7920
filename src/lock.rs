//! Distributed Lock - Leased Mutual Exclusion Over the Remote Cache
//!
//! A lock is a cache key written with `set_if_absent` and a mandatory TTL.
//! The stored value is an owner token unique to one acquisition, and release
//! deletes the key only while it still holds that token. A holder that
//! overran its lease therefore can't delete a lock someone else re-acquired.
//!
//! Leases are not fenced: a holder that stalls past its TTL may still be
//! running when the next holder starts. Callers size the TTL above the
//! expected critical section and keep writes inside it idempotent or guarded
//! by the store.
//!
//! A [`LockHandle`] is also a scope guard. Release it explicitly on the
//! normal path; a handle dropped unreleased (cancelled future, panic) spawns
//! the owner-checked delete onto the current tokio runtime.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::traits::RemoteCache;

/// Proof of a successful [`DistributedLock::acquire`]
///
/// Consumed by [`DistributedLock::release`], so a handle can be released at
/// most once.
pub struct LockHandle {
    resource_key: String,
    owner_token: String,
    expires_at: Instant,
    cache: Arc<dyn RemoteCache>,
    released: bool,
}

impl LockHandle {
    /// Full cache key of the lock
    #[must_use]
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Token stored under the key while this handle owns it
    #[must_use]
    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    /// Local instant after which the lease has lapsed
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource_key", &self.resource_key)
            .field("owner_token", &self.owner_token)
            .field("expires_at", &self.expires_at)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let key = std::mem::take(&mut self.resource_key);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "Lock handle dropped outside a runtime, lease will expire");
            return;
        };

        warn!(key = %key, "Lock handle dropped without release, releasing in background");
        let cache = Arc::clone(&self.cache);
        let token = std::mem::take(&mut self.owner_token);
        runtime.spawn(async move {
            if let Err(e) = cache.remove_if_equals(&key, token.as_bytes()).await {
                warn!(key = %key, error = %e, "Background lock release failed, lease will expire");
            }
        });
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub contended: u64,
    pub released: u64,
    /// Releases that found the lease already lapsed or taken over
    pub stale_releases: u64,
}

/// Named, leased locks shared by every process using the same remote cache
pub struct DistributedLock {
    cache: Arc<dyn RemoteCache>,
    namespace: String,
    acquired: AtomicU64,
    contended: AtomicU64,
    released: AtomicU64,
    stale_releases: AtomicU64,
}

impl DistributedLock {
    /// Lock keys live under `lock:`
    pub fn new(cache: Arc<dyn RemoteCache>) -> Self {
        Self::with_namespace(cache, "lock:")
    }

    pub fn with_namespace(cache: Arc<dyn RemoteCache>, namespace: impl Into<String>) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
            acquired: AtomicU64::new(0),
            contended: AtomicU64::new(0),
            released: AtomicU64::new(0),
            stale_releases: AtomicU64::new(0),
        }
    }

    /// Cache key used for `resource`
    #[must_use]
    pub fn key_for(&self, resource: &str) -> String {
        format!("{}{}", self.namespace, resource)
    }

    /// Try once to take the lock on `resource` for `ttl`
    ///
    /// Never waits: `Ok(None)` means another owner holds a live lease and the
    /// caller picks its own policy (fail fast, retry, queue).
    ///
    /// # Errors
    ///
    /// `CacheUnavailable` when the remote cache can't be reached.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockHandle>> {
        let resource_key = self.key_for(resource);
        let owner_token = Uuid::new_v4().to_string();
        let started = Instant::now();

        if self
            .cache
            .set_if_absent(&resource_key, owner_token.as_bytes(), ttl)
            .await?
        {
            self.acquired.fetch_add(1, Ordering::Relaxed);
            debug!(key = %resource_key, ttl_ms = %ttl.as_millis(), "Lock acquired");
            Ok(Some(LockHandle {
                resource_key,
                owner_token,
                // the lease started no later than our request
                expires_at: started + ttl,
                cache: Arc::clone(&self.cache),
                released: false,
            }))
        } else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            debug!(key = %resource_key, "Lock held by another owner");
            Ok(None)
        }
    }

    /// Release a lock taken by [`acquire`](Self::acquire)
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The lease was still ours and is now gone
    /// * `Ok(false)` - The lease had lapsed (and may belong to someone else);
    ///   nothing was deleted
    ///
    /// # Errors
    ///
    /// `CacheUnavailable` when the remote cache can't be reached; the
    /// dropped handle retries the delete in the background.
    pub async fn release(&self, mut handle: LockHandle) -> Result<bool> {
        let released = self
            .cache
            .remove_if_equals(&handle.resource_key, handle.owner_token.as_bytes())
            .await?;
        handle.released = true;

        if released {
            self.released.fetch_add(1, Ordering::Relaxed);
            debug!(key = %handle.resource_key, "Lock released");
        } else {
            self.stale_releases.fetch_add(1, Ordering::Relaxed);
            warn!(key = %handle.resource_key, "Lock lease lapsed before release");
        }
        Ok(released)
    }

    /// Release on a path that is already returning another result
    ///
    /// Failures are logged, never propagated, so they can't mask the
    /// caller's own outcome.
    pub async fn release_logged(&self, handle: LockHandle) {
        let key = handle.resource_key.clone();
        if let Err(e) = self.release(handle).await {
            warn!(key = %key, error = %e, "Lock release failed, lease will expire");
        }
    }

    #[must_use]
    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            stale_releases: self.stale_releases.load(Ordering::Relaxed),
        }
    }
}
