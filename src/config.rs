//! Configuration for the cache client, id generator and purchase flow.
//!
//! Every struct has a `Default` matching the values the flash-sale service
//! runs with in production; override individual fields with struct update
//! syntax.

use std::time::Duration;

/// Redis endpoint used when `REDIS_URL` is not set
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis URL from the `REDIS_URL` environment variable, or the default
#[must_use]
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string())
}

/// Configuration for [`CacheClient`](crate::CacheClient)
#[derive(Debug, Clone)]
pub struct CacheClientConfig {
    /// TTL of the null marker written for ids missing from the store
    pub null_ttl: Duration,
    /// Lease of the per-key rebuild lock
    pub rebuild_lock_ttl: Duration,
    /// Sleep between attempts when another caller holds the rebuild lock
    pub lock_retry_backoff: Duration,
    /// Attempts before the mutex strategy gives up with `RebuildTimeout`
    pub max_lock_retries: u32,
    /// Size of the background pool serving logical-expiration rebuilds
    pub rebuild_workers: usize,
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self {
            null_ttl: Duration::from_secs(120),
            rebuild_lock_ttl: Duration::from_secs(10),
            lock_retry_backoff: Duration::from_millis(50),
            max_lock_retries: 200,
            rebuild_workers: 10,
        }
    }
}

/// Configuration for [`SequenceGenerator`](crate::SequenceGenerator)
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Custom epoch in Unix seconds (2025-07-04T00:00:00Z)
    pub begin_timestamp: i64,
    /// Namespace of the per-day counter keys
    pub key_namespace: String,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            begin_timestamp: 1_751_587_200,
            key_namespace: "icr".to_string(),
        }
    }
}

/// Configuration for [`VoucherOrderService`](crate::VoucherOrderService)
#[derive(Debug, Clone)]
pub struct SeckillConfig {
    /// Lease of the per-user purchase lock
    pub order_lock_ttl: Duration,
    /// Sequence prefix used for order ids
    pub order_id_prefix: String,
    /// When set, voucher reads go through the pass-through cache with this TTL
    pub voucher_cache_ttl: Option<Duration>,
    /// Cache key prefix for seckill vouchers
    pub voucher_cache_prefix: String,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            order_lock_ttl: Duration::from_secs(10),
            order_id_prefix: "order".to_string(),
            voucher_cache_ttl: None,
            voucher_cache_prefix: "cache:seckill:".to_string(),
        }
    }
}
