//! Flash-Sale Core
//!
//! The concurrency core of a flash-sale ("seckill") voucher service, shared
//! by every process of the service through one remote cache:
//! - **Cache-Aside Client**: pass-through (null markers), mutex rebuild and
//!   logical expiration strategies in front of the record-of-truth store
//! - **Distributed Lock**: leased, owner-checked locks over `SET NX PX`
//! - **Sequence Generator**: 64-bit time-ordered ids from per-day `INCR`
//!   counters
//! - **Purchase Orchestrator**: one order per user and voucher, never
//!   overselling, under concurrent multi-process load
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use flash_sale::{FlashSaleBuilder, RequestContext, SeckillVoucher};
//! use flash_sale::backends::MemoryStore;
//! use chrono::{Duration, Utc};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> flash_sale::Result<()> {
//!     let store = MemoryStore::new();
//!     let now = Utc::now();
//!     store.insert_voucher(SeckillVoucher::new(1, 100, now, now + Duration::hours(1)));
//!
//!     // Redis at REDIS_URL is the default remote cache
//!     let system = FlashSaleBuilder::new()
//!         .with_store(Arc::new(store))
//!         .build()
//!         .await?;
//!
//!     let order_id = system.orders().purchase(&RequestContext::new(42), 1).await?;
//!     tracing::info!(order_id, "Purchased");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! purchase ─→ voucher lookup ─→ lock:order:<user> ─→ store tx ─→ next_id ─→ insert
//!             (store or cache)   (fail fast)         (count, decrement)
//! ```

use std::sync::Arc;
use tracing::{info, warn};

pub mod backends;
pub mod builder;
pub mod cache_client;
pub mod codecs;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod seckill;
pub mod sequence;
pub mod traits;

pub use backends::{DashMapCache, MemoryStore};

#[cfg(feature = "redis")]
pub use backends::RedisCache;

pub use builder::FlashSaleBuilder;
pub use cache_client::{CacheClient, CacheClientStats, LogicalEntry, NULL_MARKER};
pub use codecs::JsonCodec;
pub use config::{CacheClientConfig, SeckillConfig, SequenceConfig};
pub use error::{Error, Result};
pub use lock::{DistributedLock, LockHandle, LockStats};
pub use model::{SeckillPhase, SeckillVoucher, VoucherOrder};
pub use seckill::{RequestContext, VoucherOrderService};
pub use sequence::{IdParts, SequenceGenerator};
pub use traits::{CacheCodec, RemoteCache, StoreTransaction, VoucherStore};

// Re-export async_trait for implementors of the facade traits
pub use async_trait::async_trait;

/// A fully wired flash-sale core
///
/// Cheap to clone; every component is shared behind an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use flash_sale::FlashSaleBuilder;
/// use flash_sale::backends::{DashMapCache, MemoryStore};
/// use std::sync::Arc;
///
/// # async fn example() -> flash_sale::Result<()> {
/// let system = FlashSaleBuilder::new()
///     .with_cache(Arc::new(DashMapCache::new()))
///     .with_store(Arc::new(MemoryStore::new()))
///     .build()
///     .await?;
///
/// let id = system.ids().next_id("order").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FlashSaleSystem {
    cache: Arc<dyn RemoteCache>,
    lock: Arc<DistributedLock>,
    cache_client: Arc<CacheClient>,
    ids: Arc<SequenceGenerator>,
    orders: Arc<VoucherOrderService>,
}

impl FlashSaleSystem {
    /// Shorthand for [`FlashSaleBuilder::new`]
    #[must_use]
    pub fn builder() -> FlashSaleBuilder {
        FlashSaleBuilder::new()
    }

    /// Purchase flow
    #[must_use]
    pub fn orders(&self) -> &Arc<VoucherOrderService> {
        &self.orders
    }

    /// Cache-aside client for entity reads
    #[must_use]
    pub fn cache_client(&self) -> &Arc<CacheClient> {
        &self.cache_client
    }

    #[must_use]
    pub fn lock(&self) -> &Arc<DistributedLock> {
        &self.lock
    }

    #[must_use]
    pub fn ids(&self) -> &Arc<SequenceGenerator> {
        &self.ids
    }

    /// The shared remote cache every component runs against
    #[must_use]
    pub fn remote_cache(&self) -> &Arc<dyn RemoteCache> {
        &self.cache
    }

    /// `true` when the remote cache answers
    ///
    /// Locks, id counters and cached entities all live there, so nothing
    /// works without it.
    pub async fn health_check(&self) -> bool {
        if self.cache.health_check().await {
            info!(backend = self.cache.name(), "Flash-Sale health check passed");
            true
        } else {
            warn!(backend = self.cache.name(), "Flash-Sale health check failed: remote cache unreachable");
            false
        }
    }
}
