//! Cache Client - Read-Through Strategies Over the Remote Cache
//!
//! Three interchangeable ways to read an entity through the shared cache,
//! each delegating a miss to a caller-supplied loader `id -> Option<T>`:
//!
//! - [`query_with_pass_through`](CacheClient::query_with_pass_through):
//!   caches misses as a short-lived null marker (cache penetration).
//! - [`query_with_mutex`](CacheClient::query_with_mutex): a rebuild lock
//!   lets exactly one caller load a missing key while the rest wait and
//!   re-read (cache breakdown).
//! - [`query_with_logical_expire`](CacheClient::query_with_logical_expire):
//!   entries carry their own expiry, readers never wait, and an expired
//!   entry is rebuilt on a bounded background pool (stale-while-revalidate).
//!
//! # Key Layout
//!
//! ```text
//! <key_prefix><id>            entity payload, or "" as the null marker
//! lock:<lock_prefix><id>      rebuild lock (owner token, TTL)
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::codecs::JsonCodec;
use crate::config::CacheClientConfig;
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, LockHandle};
use crate::traits::{CacheCodec, RemoteCache};

/// Cached value meaning "looked up in the store, does not exist"
pub const NULL_MARKER: &[u8] = b"";

/// Wrapper stored by the logical-expiration strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalEntry<T> {
    pub data: T,
    pub expire_time: DateTime<Utc>,
}

impl<T> LogicalEntry<T> {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }
}

/// What a single cache read found
enum Lookup<T> {
    Hit(T),
    Null,
    Miss,
}

/// One round of the mutex strategy
enum RebuildAttempt<T> {
    Cached(Option<T>),
    Locked(LockHandle),
    /// Another caller is rebuilding; back off and retry
    LockUnavailable,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    hits: AtomicU64,
    null_hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    lock_retries: AtomicU64,
    stale_served: AtomicU64,
    rebuilds_scheduled: AtomicU64,
    rebuilds_completed: AtomicU64,
    rebuilds_rejected: AtomicU64,
}

/// Cache client statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheClientStats {
    pub requests: u64,
    pub hits: u64,
    pub null_hits: u64,
    pub misses: u64,
    /// Loader invocations (store reads)
    pub loads: u64,
    pub lock_retries: u64,
    /// Expired logical entries handed out while a rebuild was pending
    pub stale_served: u64,
    pub rebuilds_scheduled: u64,
    pub rebuilds_completed: u64,
    /// Rebuilds dropped because the worker pool was saturated
    pub rebuilds_rejected: u64,
    pub in_flight_rebuilds: usize,
}

/// Cache-aside client shared by every reader of cached entities
pub struct CacheClient<C = JsonCodec> {
    cache: Arc<dyn RemoteCache>,
    lock: Arc<DistributedLock>,
    codec: C,
    config: CacheClientConfig,
    rebuild_pool: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl CacheClient<JsonCodec> {
    /// JSON codec, default configuration
    pub fn new(cache: Arc<dyn RemoteCache>, lock: Arc<DistributedLock>) -> Self {
        Self::with_codec(cache, lock, JsonCodec, CacheClientConfig::default())
    }

    pub fn with_config(
        cache: Arc<dyn RemoteCache>,
        lock: Arc<DistributedLock>,
        config: CacheClientConfig,
    ) -> Self {
        Self::with_codec(cache, lock, JsonCodec, config)
    }
}

impl<C> CacheClient<C>
where
    C: CacheCodec + Clone + 'static,
{
    pub fn with_codec(
        cache: Arc<dyn RemoteCache>,
        lock: Arc<DistributedLock>,
        codec: C,
        config: CacheClientConfig,
    ) -> Self {
        info!(
            backend = cache.name(),
            codec = codec.name(),
            rebuild_workers = config.rebuild_workers,
            "Initializing Cache Client"
        );
        Self {
            rebuild_pool: Arc::new(Semaphore::new(config.rebuild_workers)),
            cache,
            lock,
            codec,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheClientConfig {
        &self.config
    }

    /// Cache `value` under `key` for `ttl`
    ///
    /// # Errors
    ///
    /// `Serialization` or `CacheUnavailable`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let bytes = encode(&self.codec, value)?;
        self.cache.set_with_ttl(key, &bytes, ttl).await
    }

    /// Cache `value` without physical TTL, logically expiring after `ttl`
    ///
    /// This is how keys read by
    /// [`query_with_logical_expire`](Self::query_with_logical_expire) get
    /// populated.
    ///
    /// # Errors
    ///
    /// `Serialization` or `CacheUnavailable`.
    pub async fn set_with_logical_expire<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let bytes = logical_bytes(&self.codec, value, ttl)?;
        self.cache.set(key, &bytes).await
    }

    /// Drop the cached copy of an entity after the store row changed
    ///
    /// Update the store first, then invalidate; the next read reloads.
    ///
    /// # Errors
    ///
    /// `CacheUnavailable`.
    pub async fn invalidate(&self, key_prefix: &str, id: impl Display) -> Result<()> {
        let key = format!("{key_prefix}{id}");
        self.cache.remove(&key).await?;
        debug!(key = %key, "Invalidated cached entity");
        Ok(())
    }

    /// Read-through with null-marker caching
    ///
    /// A hit returns the cached entity, a cached null marker returns `None`
    /// without touching the store. On a miss `loader` runs once; its result
    /// is cached for `ttl`, or a null marker for `null_ttl` when the entity
    /// doesn't exist.
    ///
    /// Concurrent misses of the same key all reach the loader; use
    /// [`query_with_mutex`](Self::query_with_mutex) to collapse them.
    ///
    /// # Errors
    ///
    /// Loader errors, `CacheUnavailable`, `Serialization`.
    pub async fn query_with_pass_through<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = format!("{key_prefix}{id}");
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        match self.lookup::<T>(&key).await? {
            Lookup::Hit(value) => return Ok(Some(value)),
            Lookup::Null => return Ok(None),
            Lookup::Miss => {}
        }

        self.load_and_fill(&key, id, loader, ttl).await
    }

    /// Read-through where one caller per key rebuilds a missing entry
    ///
    /// On a miss the caller takes the rebuild lock `lock:<lock_prefix><id>`.
    /// Losers sleep `lock_retry_backoff` and start over from the cache read,
    /// so they pick up the winner's result. The winner re-reads the cache
    /// under the lock, loads, writes the value (or a null marker) and
    /// releases the lock on every path.
    ///
    /// # Errors
    ///
    /// `RebuildTimeout` after `max_lock_retries` lost attempts, plus the
    /// errors of [`query_with_pass_through`](Self::query_with_pass_through).
    pub async fn query_with_mutex<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        lock_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        I: Display,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = format!("{key_prefix}{id}");
        let lock_resource = format!("{lock_prefix}{id}");
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut attempts: u32 = 0;
        let handle = loop {
            match self.try_rebuild_lock::<T>(&key, &lock_resource).await? {
                RebuildAttempt::Cached(value) => return Ok(value),
                RebuildAttempt::Locked(handle) => break handle,
                RebuildAttempt::LockUnavailable => {
                    attempts += 1;
                    if attempts >= self.config.max_lock_retries {
                        warn!(key = %key, attempts, "Gave up waiting for cache rebuild");
                        return Err(Error::RebuildTimeout { key, attempts });
                    }
                    self.counters.lock_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.config.lock_retry_backoff).await;
                }
            }
        };

        let outcome = async {
            // another caller may have finished the rebuild between our miss and the lock
            match self.lookup::<T>(&key).await? {
                Lookup::Hit(value) => Ok(Some(value)),
                Lookup::Null => Ok(None),
                Lookup::Miss => self.load_and_fill(&key, id, loader, ttl).await,
            }
        }
        .await;

        self.lock.release_logged(handle).await;
        outcome
    }

    /// Stale-while-revalidate read of a pre-populated key
    ///
    /// - Absent key (or null marker): `None` immediately. This strategy does
    ///   not defend against penetration; populate keys with
    ///   [`set_with_logical_expire`](Self::set_with_logical_expire).
    /// - Fresh entry: returned without any lock traffic.
    /// - Expired entry: the stale value is returned right away. If this
    ///   caller wins the rebuild lock and a pool worker is free, `loader`
    ///   runs in the background, writes a fresh entry expiring after `ttl`
    ///   and releases the lock however the load ends. A failed re-read
    ///   under the lock releases it and serves the stale value.
    ///
    /// # Errors
    ///
    /// `CacheUnavailable`, or `Serialization` when the stored wrapper can't
    /// be decoded.
    pub async fn query_with_logical_expire<T, I, F, Fut>(
        &self,
        key_prefix: &str,
        lock_prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        I: Display + Send + 'static,
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let key = format!("{key_prefix}{id}");
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let Some(entry) = self.read_logical::<T>(&key).await? else {
            return Ok(None);
        };
        if !entry.is_expired_at(Utc::now()) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.data));
        }

        let lock_resource = format!("{lock_prefix}{id}");
        let Some(handle) = self
            .lock
            .acquire(&lock_resource, self.config.rebuild_lock_ttl)
            .await?
        else {
            debug!(key = %key, "Rebuild already in flight, serving stale entry");
            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.data));
        };

        // a rebuild may have landed between our read and the lock
        match self.read_logical::<T>(&key).await {
            Ok(Some(current)) if !current.is_expired_at(Utc::now()) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.lock.release_logged(handle).await;
                return Ok(Some(current.data));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Re-read under rebuild lock failed, serving stale entry");
                self.lock.release_logged(handle).await;
                self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(entry.data));
            }
        }

        let Ok(permit) = Arc::clone(&self.rebuild_pool).try_acquire_owned() else {
            self.counters.rebuilds_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "Rebuild pool saturated, rebuild rejected");
            self.lock.release_logged(handle).await;
            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.data));
        };

        self.counters.rebuilds_scheduled.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::clone(&self.cache);
        let lock = Arc::clone(&self.lock);
        let counters = Arc::clone(&self.counters);
        let codec = self.codec.clone();
        let rebuild_key = key.clone();

        tokio::spawn(async move {
            let _permit = permit;
            counters.loads.fetch_add(1, Ordering::Relaxed);

            let outcome = match loader(id).await {
                Ok(Some(fresh)) => {
                    let encoded = logical_bytes(&codec, &fresh, ttl);
                    match encoded {
                        Ok(bytes) => cache.set(&rebuild_key, &bytes).await,
                        Err(e) => Err(e),
                    }
                }
                // the entity is gone from the store
                Ok(None) => cache.remove(&rebuild_key).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => debug!(key = %rebuild_key, "Logical-expire rebuild finished"),
                Err(e) => error!(key = %rebuild_key, error = %e, "Logical-expire rebuild failed, stale entry kept"),
            }

            lock.release_logged(handle).await;
            counters.rebuilds_completed.fetch_add(1, Ordering::Relaxed);
        });

        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.data))
    }

    #[must_use]
    pub fn stats(&self) -> CacheClientStats {
        let c = &self.counters;
        CacheClientStats {
            requests: c.requests.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            null_hits: c.null_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            lock_retries: c.lock_retries.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            rebuilds_scheduled: c.rebuilds_scheduled.load(Ordering::Relaxed),
            rebuilds_completed: c.rebuilds_completed.load(Ordering::Relaxed),
            rebuilds_rejected: c.rebuilds_rejected.load(Ordering::Relaxed),
            in_flight_rebuilds: self
                .config
                .rebuild_workers
                .saturating_sub(self.rebuild_pool.available_permits()),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>> {
        match self.cache.get(key).await? {
            Some(bytes) if bytes.as_slice() == NULL_MARKER => {
                self.counters.null_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Null marker hit");
                Ok(Lookup::Null)
            }
            Some(bytes) => match self.codec.deserialize::<T>(&bytes) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(Lookup::Hit(value))
                }
                Err(e) => {
                    // unreadable entry (schema drift, corruption): reload and overwrite it
                    warn!(key = %key, error = %e, "Cached value failed to decode, treating as miss");
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    Ok(Lookup::Miss)
                }
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(Lookup::Miss)
            }
        }
    }

    async fn try_rebuild_lock<T: DeserializeOwned>(
        &self,
        key: &str,
        lock_resource: &str,
    ) -> Result<RebuildAttempt<T>> {
        match self.lookup::<T>(key).await? {
            Lookup::Hit(value) => return Ok(RebuildAttempt::Cached(Some(value))),
            Lookup::Null => return Ok(RebuildAttempt::Cached(None)),
            Lookup::Miss => {}
        }
        Ok(
            match self
                .lock
                .acquire(lock_resource, self.config.rebuild_lock_ttl)
                .await?
            {
                Some(handle) => RebuildAttempt::Locked(handle),
                None => RebuildAttempt::LockUnavailable,
            },
        )
    }

    async fn load_and_fill<T, I, F, Fut>(&self, key: &str, id: I, loader: F, ttl: Duration) -> Result<Option<T>>
    where
        T: Serialize,
        F: FnOnce(I) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        match loader(id).await? {
            Some(value) => {
                self.set(key, &value, ttl).await?;
                debug!(key = %key, ttl_ms = %ttl.as_millis(), "Loaded and cached entity");
                Ok(Some(value))
            }
            None => {
                self.cache
                    .set_with_ttl(key, NULL_MARKER, self.config.null_ttl)
                    .await?;
                debug!(key = %key, "Entity missing from store, cached null marker");
                Ok(None)
            }
        }
    }

    async fn read_logical<T: DeserializeOwned>(&self, key: &str) -> Result<Option<LogicalEntry<T>>> {
        match self.cache.get(key).await? {
            Some(bytes) if bytes.as_slice() != NULL_MARKER => {
                Ok(Some(decode::<C, LogicalEntry<T>>(&self.codec, &bytes)?))
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }
}

fn encode<C: CacheCodec, T: Serialize + ?Sized>(codec: &C, value: &T) -> Result<Vec<u8>> {
    codec
        .serialize(value)
        .map_err(|e| Error::Serialization(format!("{e:#}")))
}

fn decode<C: CacheCodec, T: DeserializeOwned>(codec: &C, bytes: &[u8]) -> Result<T> {
    codec
        .deserialize(bytes)
        .map_err(|e| Error::Serialization(format!("{e:#}")))
}

/// Encode a logical-expire wrapper; kept synchronous so no borrow of the
/// value lives across an await.
fn logical_bytes<C: CacheCodec, T: Serialize>(codec: &C, value: &T, ttl: Duration) -> Result<Vec<u8>> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let expire_time = Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
    encode(codec, &LogicalEntry { data: value, expire_time })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::DashMapCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    /// Delegates to a `DashMapCache` but fails the `fail_on`-th `get`
    struct FlakyCache {
        inner: DashMapCache,
        gets: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl RemoteCache for FlakyCache {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.gets.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(Error::CacheUnavailable("connection reset".into()));
            }
            self.inner.get(key).await
        }

        async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            self.inner.set(key, value).await
        }

        async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }

        async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
            self.inner.remove_if_equals(key, expected).await
        }

        async fn increment(&self, key: &str) -> Result<i64> {
            self.inner.increment(key).await
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    async fn eventually_absent(cache: &DashMapCache, key: &str) -> bool {
        for _ in 0..100 {
            if !cache.contains(key) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shop {
        id: u64,
        name: String,
    }

    fn client() -> (Arc<DashMapCache>, CacheClient) {
        let cache = Arc::new(DashMapCache::new());
        let lock = Arc::new(DistributedLock::new(cache.clone()));
        (cache.clone(), CacheClient::new(cache, lock))
    }

    #[tokio::test]
    async fn test_pass_through_caches_value() {
        let (cache, client) = client();
        let loads = AtomicU32::new(0);
        let ttl = Duration::from_secs(60);

        for _ in 0..3 {
            let shop = client
                .query_with_pass_through("cache:shop:", 1_u64, |id| {
                    loads.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(Some(Shop { id, name: "noodles".into() })) }
                }, ttl)
                .await
                .unwrap_or_else(|e| panic!("query failed: {e}"));
            assert_eq!(shop.map(|s| s.name), Some("noodles".to_string()));
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(cache.ttl("cache:shop:1").is_some_and(|t| t <= ttl));
    }

    #[tokio::test]
    async fn test_pass_through_null_marker_ttl() {
        let (cache, client) = client();

        let found: Option<Shop> = client
            .query_with_pass_through("cache:shop:", 404_u64, |_| async { Ok(None) }, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert!(found.is_none());

        let marker_ttl = cache
            .ttl("cache:shop:404")
            .unwrap_or_else(|| panic!("null marker must carry a TTL"));
        assert!(marker_ttl <= client.config().null_ttl);
    }

    #[tokio::test]
    async fn test_loader_error_propagates_without_caching() {
        let (cache, client) = client();

        let result: Result<Option<Shop>> = client
            .query_with_pass_through(
                "cache:shop:",
                5_u64,
                |_| async { Err(Error::StoreUnavailable("connection refused".into())) },
                Duration::from_secs(60),
            )
            .await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert!(!cache.contains("cache:shop:5"));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_reloaded() {
        let (cache, client) = client();
        cache
            .set_with_ttl("cache:shop:9", b"{\"legacy\":true}", Duration::from_secs(60))
            .await
            .unwrap_or_else(|_| panic!("seed failed"));

        let shop = client
            .query_with_pass_through("cache:shop:", 9_u64, |id| async move {
                Ok(Some(Shop { id, name: "fresh".into() }))
            }, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert_eq!(shop.map(|s| s.name), Some("fresh".to_string()));
    }

    #[tokio::test]
    async fn test_mutex_gives_up_after_retry_cap() {
        let cache = Arc::new(DashMapCache::new());
        let lock = Arc::new(DistributedLock::new(cache.clone()));
        let config = CacheClientConfig {
            lock_retry_backoff: Duration::from_millis(1),
            max_lock_retries: 3,
            ..CacheClientConfig::default()
        };
        let client = CacheClient::with_config(cache, lock.clone(), config);

        let _held = lock
            .acquire("shop:1", Duration::from_secs(30))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("pre-acquire failed"));

        let result: Result<Option<Shop>> = client
            .query_with_mutex("cache:shop:", "shop:", 1_u64, |_| async { Ok(None) }, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::RebuildTimeout { attempts: 3, .. })));
        assert_eq!(client.stats().loads, 0);
    }

    #[tokio::test]
    async fn test_mutex_releases_lock_after_load_error() {
        let (cache, client) = client();

        let result: Result<Option<Shop>> = client
            .query_with_mutex(
                "cache:shop:",
                "shop:",
                2_u64,
                |_| async { Err(Error::StoreUnavailable("timeout".into())) },
                Duration::from_secs(60),
            )
            .await;
        assert!(result.is_err());
        assert!(!cache.contains("lock:shop:2"), "rebuild lock leaked");
    }

    #[tokio::test]
    async fn test_logical_expire_absent_key() {
        let (_, client) = client();
        let loads = Arc::new(AtomicU32::new(0));
        let counter = loads.clone();

        let found: Option<Shop> = client
            .query_with_logical_expire("cache:shop:", "shop:", 3_u64, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }, Duration::from_secs(20))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert!(found.is_none());
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logical_expire_fresh_entry_skips_lock() {
        let (cache, client) = client();
        let shop = Shop { id: 4, name: "tea".into() };
        client
            .set_with_logical_expire("cache:shop:4", &shop, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("set failed: {e}"));
        assert_eq!(cache.ttl("cache:shop:4"), None, "logical entries carry no physical TTL");

        let loads = Arc::new(AtomicU32::new(0));
        let counter = loads.clone();
        let found = client
            .query_with_logical_expire("cache:shop:", "shop:", 4_u64, move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert_eq!(found, Some(shop));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(client.stats().rebuilds_scheduled, 0);
        assert!(!cache.contains("lock:shop:4"));
    }

    #[tokio::test]
    async fn test_logical_expire_rebuild_pool_saturated() {
        let cache = Arc::new(DashMapCache::new());
        let lock = Arc::new(DistributedLock::new(cache.clone()));
        let config = CacheClientConfig {
            rebuild_workers: 0,
            ..CacheClientConfig::default()
        };
        let client = CacheClient::with_config(cache.clone(), lock, config);
        let stale = Shop { id: 6, name: "old".into() };
        client
            .set_with_logical_expire("cache:shop:6", &stale, Duration::ZERO)
            .await
            .unwrap_or_else(|e| panic!("set failed: {e}"));

        let found = client
            .query_with_logical_expire("cache:shop:", "shop:", 6_u64, |id| async move {
                Ok(Some(Shop { id, name: "new".into() }))
            }, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));

        assert_eq!(found, Some(stale));
        assert_eq!(client.stats().rebuilds_rejected, 1);
        assert!(!cache.contains("lock:shop:6"), "rejected rebuild must release its lock");
    }

    #[tokio::test]
    async fn test_mutex_lock_freed_when_caller_is_cancelled() {
        let (cache, client) = client();

        let slow_load = client.query_with_mutex(
            "cache:shop:",
            "shop:",
            11_u64,
            |id| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Some(Shop { id, name: "slow".into() }))
            },
            Duration::from_secs(60),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(20), slow_load).await;
        assert!(timed_out.is_err());

        assert!(eventually_absent(&cache, "lock:shop:11").await, "cancelled rebuild kept its lock");
        let shop = client
            .query_with_mutex("cache:shop:", "shop:", 11_u64, |id| async move {
                Ok(Some(Shop { id, name: "retry".into() }))
            }, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert_eq!(shop.map(|s| s.name), Some("retry".to_string()));
    }

    #[tokio::test]
    async fn test_mutex_lock_freed_when_loader_panics() {
        let (cache, client) = client();
        let client = Arc::new(client);

        let task = tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                client
                    .query_with_mutex(
                        "cache:shop:",
                        "shop:",
                        12_u64,
                        |_: u64| -> std::future::Ready<Result<Option<Shop>>> { panic!("loader crashed") },
                        Duration::from_secs(60),
                    )
                    .await
            }
        });
        assert!(task.await.is_err_and(|e| e.is_panic()));

        assert!(eventually_absent(&cache, "lock:shop:12").await, "panicked rebuild kept its lock");
    }

    #[tokio::test]
    async fn test_logical_expire_reread_failure_releases_lock() {
        // first get reads the stale entry, the re-read under the lock fails
        let flaky = Arc::new(FlakyCache {
            inner: DashMapCache::new(),
            gets: AtomicUsize::new(0),
            fail_on: 2,
        });
        let lock = Arc::new(DistributedLock::new(flaky.clone()));
        let client = CacheClient::new(flaky.clone(), lock);
        let stale = Shop { id: 13, name: "old".into() };
        client
            .set_with_logical_expire("cache:shop:13", &stale, Duration::ZERO)
            .await
            .unwrap_or_else(|e| panic!("set failed: {e}"));

        let found = client
            .query_with_logical_expire("cache:shop:", "shop:", 13_u64, |id| async move {
                Ok(Some(Shop { id, name: "new".into() }))
            }, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));

        assert_eq!(found, Some(stale));
        assert!(!flaky.inner.contains("lock:shop:13"), "failed re-read kept the rebuild lock");
        let stats = client.stats();
        assert_eq!(stats.stale_served, 1);
        assert_eq!(stats.rebuilds_scheduled, 0);
    }

    #[tokio::test]
    async fn test_logical_expire_counts_only_stale_returns() {
        let (cache, client) = client();
        let stale = Shop { id: 14, name: "old".into() };
        client
            .set_with_logical_expire("cache:shop:14", &stale, Duration::ZERO)
            .await
            .unwrap_or_else(|e| panic!("set failed: {e}"));

        let load = |id: u64| async move { Ok::<_, Error>(Some(Shop { id, name: "new".into() })) };
        let first = client
            .query_with_logical_expire("cache:shop:", "shop:", 14_u64, load, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert_eq!(first, Some(stale));
        assert!(eventually_absent(&cache, "lock:shop:14").await, "rebuild never released its lock");

        let second = client
            .query_with_logical_expire("cache:shop:", "shop:", 14_u64, load, Duration::from_secs(60))
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert_eq!(second.map(|s| s.name), Some("new".to_string()));

        let stats = client.stats();
        assert_eq!(stats.stale_served, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.rebuilds_scheduled, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let (_, client) = client();
        let ttl = Duration::from_secs(60);
        let load = |name: &'static str| {
            move |id: u64| async move { Ok::<_, Error>(Some(Shop { id, name: name.to_string() })) }
        };

        client
            .query_with_pass_through("cache:shop:", 8_u64, load("before"), ttl)
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        client
            .invalidate("cache:shop:", 8)
            .await
            .unwrap_or_else(|e| panic!("invalidate failed: {e}"));

        let shop = client
            .query_with_pass_through("cache:shop:", 8_u64, load("after"), ttl)
            .await
            .unwrap_or_else(|e| panic!("query failed: {e}"));
        assert_eq!(shop.map(|s| s.name), Some("after".to_string()));
    }
}
