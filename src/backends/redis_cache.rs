//! Redis Cache - Shared Remote Cache Backend
//!
//! The production [`RemoteCache`]: one Redis instance shared by every
//! process of the service.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Deletes `KEYS[1]` only while it still holds `ARGV[1]`
const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Redis remote cache with `ConnectionManager` for automatic reconnection
///
/// Provides:
/// - `SET key value NX PX ttl` for lock acquisition
/// - A compare-and-delete Lua script for owner-checked lock release
/// - `INCR` for the per-day id counters
pub struct RedisCache {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    compare_and_delete: Script,
}

impl RedisCache {
    /// Connect using `REDIS_URL` (default `redis://127.0.0.1:6379`)
    ///
    /// # Errors
    ///
    /// Returns `CacheUnavailable` if the client cannot be created or the
    /// connection check fails.
    pub async fn new() -> Result<Self> {
        Self::with_url(&crate::config::redis_url()).await
    }

    /// Connect to a specific Redis URL
    ///
    /// # Errors
    ///
    /// Returns `CacheUnavailable` if the client cannot be created or the
    /// connection check fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis Cache with ConnectionManager");

        let client = Client::open(redis_url).map_err(|e| {
            Error::CacheUnavailable(format!("invalid Redis URL {redis_url}: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            Error::CacheUnavailable(format!("failed to connect to {redis_url}: {e}"))
        })?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(redis_url = %redis_url, "Redis Cache connected successfully");

        Ok(Self {
            conn_manager,
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
        })
    }
}

/// Millisecond TTL for `PX`, never zero
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

// ===== Trait Implementations =====

use crate::traits::RemoteCache;
use async_trait::async_trait;

#[async_trait]
impl RemoteCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();

        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn_manager.clone();

        let _: () = conn.set(key, value).await?;
        debug!(key = %key, "[Redis] Cached key without expiry");
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();

        // OK when set, nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        let value: i64 = conn.incr(key, 1_i64).await?;
        Ok(value)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        matches!(pong.as_deref(), Ok("PONG"))
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
