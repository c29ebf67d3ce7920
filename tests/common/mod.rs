//! Common utilities for integration tests
//!
//! - In-process system fixtures (`DashMapCache` + `MemoryStore`)
//! - Voucher and entity generators
//! - Polling helper for background work

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use flash_sale::backends::{DashMapCache, MemoryStore};
use flash_sale::{FlashSaleBuilder, FlashSaleSystem, SeckillConfig, SeckillVoucher};
use std::sync::Arc;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    flash_sale::config::redis_url()
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// A wired system plus direct handles on its in-process backends
pub struct TestSystem {
    pub system: FlashSaleSystem,
    pub cache: Arc<DashMapCache>,
    pub store: MemoryStore,
}

/// System over fresh in-process backends
pub async fn setup_system() -> TestSystem {
    setup_system_with(SeckillConfig::default()).await
}

pub async fn setup_system_with(seckill_config: SeckillConfig) -> TestSystem {
    let cache = Arc::new(DashMapCache::new());
    let store = MemoryStore::new();
    let system = FlashSaleBuilder::new()
        .with_cache(cache.clone())
        .with_store(Arc::new(store.clone()))
        .with_seckill_config(seckill_config)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build system: {e}"));

    TestSystem { system, cache, store }
}

/// Voucher whose sale window is open right now
pub fn open_voucher(voucher_id: u64, stock: u32) -> SeckillVoucher {
    let now = Utc::now();
    SeckillVoucher::new(
        voucher_id,
        stock,
        now - ChronoDuration::hours(1),
        now + ChronoDuration::hours(1),
    )
}

pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Shop {
        pub id: u64,
        pub name: String,
        pub area: String,
    }

    impl Shop {
        pub fn new(id: u64) -> Self {
            Self {
                id,
                name: format!("Shop {id}"),
                area: format!("Area {}", id % 5),
            }
        }

        pub fn renamed(id: u64, name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Self::new(id)
            }
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("shop");
        let key2 = test_key("shop");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("test_shop_"));
    }
}
