//! Flash-Sale System Builder
//!
//! Wires the remote cache, the voucher store and the three configuration
//! structs into a [`FlashSaleSystem`].
//!
//! # Example: In-Process Backends
//!
//! ```rust,no_run
//! use flash_sale::FlashSaleBuilder;
//! use flash_sale::backends::{DashMapCache, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> flash_sale::Result<()> {
//! let system = FlashSaleBuilder::new()
//!     .with_cache(Arc::new(DashMapCache::new()))
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! let system = FlashSaleBuilder::new()
//!     .with_store(Arc::new(MyPostgresStore::connect(url).await?))
//!     .build()   // remote cache defaults to Redis at REDIS_URL
//!     .await?;
//! ```

use std::sync::Arc;
use tracing::info;

use crate::cache_client::CacheClient;
use crate::config::{CacheClientConfig, SeckillConfig, SequenceConfig};
use crate::error::{Error, Result};
use crate::lock::DistributedLock;
use crate::seckill::VoucherOrderService;
use crate::sequence::SequenceGenerator;
use crate::traits::{RemoteCache, VoucherStore};
use crate::FlashSaleSystem;

/// Builder for [`FlashSaleSystem`]
///
/// # Default Behavior
///
/// - **Remote cache**: Redis at `REDIS_URL` with the `redis` feature,
///   otherwise an in-process `DashMapCache`
/// - **Store**: none; a store must be supplied
/// - **Configs**: their `Default` values
#[derive(Default)]
pub struct FlashSaleBuilder {
    cache: Option<Arc<dyn RemoteCache>>,
    store: Option<Arc<dyn VoucherStore>>,
    cache_config: CacheClientConfig,
    sequence_config: SequenceConfig,
    seckill_config: SeckillConfig,
}

impl FlashSaleBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific remote cache instead of the default one
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn RemoteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record-of-truth store for vouchers and orders (required)
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn VoucherStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_cache_config(mut self, config: CacheClientConfig) -> Self {
        self.cache_config = config;
        self
    }

    #[must_use]
    pub fn with_sequence_config(mut self, config: SequenceConfig) -> Self {
        self.sequence_config = config;
        self
    }

    #[must_use]
    pub fn with_seckill_config(mut self, config: SeckillConfig) -> Self {
        self.seckill_config = config;
        self
    }

    /// Build the system
    ///
    /// # Errors
    ///
    /// * `StoreUnavailable` - No store was configured
    /// * `CacheUnavailable` - The default Redis cache could not connect
    pub async fn build(self) -> Result<FlashSaleSystem> {
        let store = self
            .store
            .ok_or_else(|| Error::StoreUnavailable("no voucher store configured".to_string()))?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => default_cache().await?,
        };
        info!(backend = cache.name(), "Building Flash-Sale System");

        let lock = Arc::new(DistributedLock::new(Arc::clone(&cache)));
        let cache_client = Arc::new(CacheClient::with_config(
            Arc::clone(&cache),
            Arc::clone(&lock),
            self.cache_config,
        ));
        let ids = Arc::new(SequenceGenerator::with_config(
            Arc::clone(&cache),
            self.sequence_config,
        ));

        let cached_vouchers = self.seckill_config.voucher_cache_ttl.is_some();
        let mut orders = VoucherOrderService::new(store, Arc::clone(&lock), Arc::clone(&ids), self.seckill_config);
        if cached_vouchers {
            orders = orders.with_voucher_cache(Arc::clone(&cache_client));
        }

        info!(cached_vouchers, "Flash-Sale System built successfully");

        Ok(FlashSaleSystem {
            cache,
            lock,
            cache_client,
            ids,
            orders: Arc::new(orders),
        })
    }
}

#[cfg(feature = "redis")]
async fn default_cache() -> Result<Arc<dyn RemoteCache>> {
    Ok(Arc::new(crate::backends::RedisCache::new().await?))
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn default_cache() -> Result<Arc<dyn RemoteCache>> {
    Ok(Arc::new(crate::backends::DashMapCache::new()))
}
