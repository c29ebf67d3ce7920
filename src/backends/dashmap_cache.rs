//! `DashMap` Cache - In-Process Remote Cache Stand-In
//!
//! A [`RemoteCache`] kept in process memory. Every operation the facade
//! promises to be atomic (`set_if_absent`, `remove_if_equals`, `increment`)
//! runs under the `DashMap` shard lock of its key, so tasks of one process
//! observe the same guarantees Redis gives to many processes.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Cache entry with optional expiration
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// Concurrent in-memory cache using `DashMap`
///
/// **Use Case**: tests, demos and single-process deployments
///
/// **Limitations**:
/// - Coordination only spans the tasks of the owning process
/// - Expired entries are dropped lazily on access or via `cleanup_expired`
///
/// **Example**:
/// ```rust
/// use flash_sale::backends::DashMapCache;
/// use flash_sale::RemoteCache;
/// use std::time::Duration;
///
/// # async fn example() -> flash_sale::Result<()> {
/// let cache = DashMapCache::new();
///
/// assert!(cache.set_if_absent("lock:order:1", b"owner-a", Duration::from_secs(10)).await?);
/// assert!(!cache.set_if_absent("lock:order:1", b"owner-b", Duration::from_secs(10)).await?);
/// assert_eq!(cache.increment("icr:order:2025:07:04").await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct DashMapCache {
    map: DashMap<String, CacheEntry>,
}

impl DashMapCache {
    /// Create new `DashMap` cache
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing DashMap Cache (in-process remote cache)");

        Self {
            map: DashMap::new(),
        }
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[DashMap] Cleaned up expired entries");
        }
        removed
    }

    /// Remaining time-to-live of a key; `None` when absent or persistent
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.map.get(key)?;
        if entry.is_expired() {
            return None;
        }
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// `true` when the key holds a live value
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.map.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Current number of stored entries (including not yet swept expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn store(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        self.map
            .insert(key.to_string(), CacheEntry::new(value.to_vec(), ttl));
    }
}

impl Default for DashMapCache {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Trait Implementations =====

use crate::traits::RemoteCache;
use async_trait::async_trait;

#[async_trait]
impl RemoteCache for DashMapCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.map.get(key) {
            if entry.is_expired() {
                drop(entry); // release the shard read lock before removing
                self.map.remove_if(key, |_, entry| entry.is_expired());
                Ok(None)
            } else {
                Ok(Some(entry.value.clone()))
            }
        } else {
            Ok(None)
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.store(key, value, Some(ttl));
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[DashMap] Cached key with TTL");
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.store(key, value, None);
        debug!(key = %key, "[DashMap] Cached key without expiry");
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let fresh = CacheEntry::new(value.to_vec(), Some(ttl));
        let inserted = match self.map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        Ok(inserted)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let removed = self
            .map
            .remove_if(key, |_, entry| {
                !entry.is_expired() && entry.value.as_slice() == expected
            })
            .is_some();
        Ok(removed)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::new(b"0".to_vec(), None));
        if entry.is_expired() {
            *entry = CacheEntry::new(b"0".to_vec(), None);
        }

        let current: i64 = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| {
                Error::CacheUnavailable(format!("value at '{key}' is not an integer"))
            })?;
        let next = current.checked_add(1).ok_or_else(|| {
            Error::CacheUnavailable(format!("increment of '{key}' would overflow"))
        })?;
        entry.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_dashmap";
        let test_value = b"health_check_value";

        match self
            .set_with_ttl(test_key, test_value, Duration::from_secs(60))
            .await
        {
            Ok(()) => match self.get(test_key).await {
                Ok(Some(retrieved)) => {
                    let _ = self.remove(test_key).await;
                    retrieved == test_value
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "DashMap"
    }
}
