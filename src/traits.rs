//! Facade Traits
//!
//! This module defines the seams between the flash-sale core and the shared
//! infrastructure it runs against.
//!
//! # Architecture
//!
//! - `CacheCodec`: Trait for pluggable serialization of cached entities
//! - `RemoteCache`: The shared remote key-value cache (Redis in production)
//! - `VoucherStore`: The record-of-truth store for vouchers and orders
//! - `StoreTransaction`: An explicit transaction scope over `VoucherStore`
//!
//! # Example: Custom Remote Cache
//!
//! ```rust,ignore
//! use flash_sale::{RemoteCache, async_trait, Result};
//! use std::time::Duration;
//!
//! struct MyCache {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl RemoteCache for MyCache {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
//!         // Your implementation
//!     }
//!
//!     // ... implement other methods
//! }
//! ```

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::model::{SeckillVoucher, VoucherOrder};

/// Trait for cache value serialization/deserialization
///
/// Entities written by [`CacheClient`](crate::CacheClient) go through a codec
/// before they reach the remote cache. The null marker is always the empty
/// byte string, so a codec must never encode a value to zero bytes.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks
/// and provide debugging capabilities.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> AnyResult<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode to `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> AnyResult<T>;

    /// Get the name of the codec, used for logging.
    fn name(&self) -> &'static str;
}

/// Shared remote key-value cache
///
/// Every process of the service talks to the same instance, so locks and
/// counters kept here coordinate across process boundaries, not just across
/// tasks of one process.
///
/// # Required Operations
///
/// - `get` / `set_with_ttl` / `set` / `remove`: plain value access
/// - `set_if_absent`: atomic "set if not present, with expiry" (lock acquire)
/// - `remove_if_equals`: atomic compare-and-delete (owner-checked lock release)
/// - `increment`: atomic counter increment (sequence generation)
///
/// # Value Semantics
///
/// An empty byte string is a legitimate stored value, distinct from an absent
/// key. The cache-aside strategies rely on this to store null markers.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Get value by key
    ///
    /// # Returns
    ///
    /// * `Ok(Some(bytes))` - Key present (possibly an empty null marker)
    /// * `Ok(None)` - Key absent or expired
    /// * `Err(CacheUnavailable)` - The cache could not be reached
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set value with a time-to-live
    ///
    /// # Arguments
    ///
    /// * `key` - The cache key
    /// * `value` - The value to store
    /// * `ttl` - Time-to-live duration
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Set value without physical expiry
    ///
    /// Used for entries that carry their own logical expiry.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Set value only if the key does not exist, with a time-to-live
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The key was set by this call
    /// * `Ok(false)` - The key already exists
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Remove value (no-op when absent)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove the key only if it currently holds `expected`
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The key held `expected` and was deleted
    /// * `Ok(false)` - The key was absent or held another value
    async fn remove_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Atomically increment the integer stored at `key`, creating it at 0
    ///
    /// # Returns
    ///
    /// The value after the increment.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Check if the cache is reachable and answering
    async fn health_check(&self) -> bool;

    /// Backend name, used for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Record-of-truth store for seckill vouchers and orders
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Read a seckill voucher row
    ///
    /// # Returns
    ///
    /// * `Ok(Some(voucher))` - Row found
    /// * `Ok(None)` - No such voucher
    /// * `Err(StoreUnavailable)` - The store failed
    async fn seckill_voucher(&self, voucher_id: u64) -> Result<Option<SeckillVoucher>>;

    /// Open a transaction scope
    ///
    /// Work done through the returned handle becomes durable on `commit` and
    /// is undone on `rollback` (or when the handle is dropped uncommitted).
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// Transaction scope over [`VoucherStore`]
#[async_trait]
pub trait StoreTransaction: Send {
    /// Count orders of `user_id` for `voucher_id`
    async fn count_orders(&mut self, user_id: u64, voucher_id: u64) -> Result<u64>;

    /// `UPDATE stock = stock - 1 WHERE voucher_id = ? AND stock > 0`
    ///
    /// # Returns
    ///
    /// The number of affected rows: `1` when a unit was taken, `0` when the
    /// voucher is sold out (or unknown).
    async fn decrement_stock(&mut self, voucher_id: u64) -> Result<u64>;

    /// Insert an order, backed by a unique `(user_id, voucher_id)` constraint
    ///
    /// # Errors
    ///
    /// `AlreadyPurchased` when the constraint rejects the row.
    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()>;

    /// Make every change of this transaction durable
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Undo every change of this transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}
