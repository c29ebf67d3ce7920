//! Seckill Demo
//!
//! Runs a contended flash sale on in-process backends: 500 buyers race for
//! 100 vouchers, a handful of them double-submit, then a cached shop lookup
//! shows the cache-aside strategies.
//!
//! Run with: cargo run --example seckill_demo
//! More detail: RUST_LOG=flash_sale=debug cargo run --example seckill_demo

use chrono::{Duration as ChronoDuration, Utc};
use flash_sale::backends::{DashMapCache, MemoryStore};
use flash_sale::{Error, FlashSaleBuilder, RequestContext, SeckillConfig, SeckillVoucher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shop {
    id: u64,
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = MemoryStore::new();
    let now = Utc::now();
    store.insert_voucher(SeckillVoucher::new(1, 100, now - ChronoDuration::minutes(1), now + ChronoDuration::hours(1)));

    let system = FlashSaleBuilder::new()
        .with_cache(Arc::new(DashMapCache::new()))
        .with_store(Arc::new(store.clone()))
        .with_seckill_config(SeckillConfig {
            voucher_cache_ttl: Some(Duration::from_secs(5)),
            ..SeckillConfig::default()
        })
        .build()
        .await?;

    // 1. Flash sale: 500 buyers, every tenth one submits twice
    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for user_id in 1..=500_u64 {
        let submits = if user_id % 10 == 0 { 2 } else { 1 };
        for _ in 0..submits {
            let orders = Arc::clone(system.orders());
            tasks.spawn(async move { orders.purchase(&RequestContext::new(user_id), 1).await });
        }
    }

    let (mut sold, mut sold_out, mut duplicates) = (0, 0, 0);
    while let Some(result) = tasks.join_next().await {
        match result? {
            Ok(_) => sold += 1,
            Err(Error::OutOfStock { .. }) => sold_out += 1,
            Err(Error::DuplicateOrderRejected { .. } | Error::AlreadyPurchased { .. }) => duplicates += 1,
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        sold,
        sold_out,
        duplicates,
        remaining_stock = ?store.stock(1),
        elapsed_ms = started.elapsed().as_millis(),
        "Flash sale finished"
    );

    // 2. Cache-aside reads of a shop
    let client = system.cache_client();
    for _ in 0..3 {
        let shop = client
            .query_with_mutex("cache:shop:", "shop:", 1_u64, |id| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Some(Shop { id, name: "Noodle Bar".to_string() }))
            }, Duration::from_secs(30))
            .await?;
        tracing::info!(?shop, "Shop lookup");
    }
    let missing: Option<Shop> = client
        .query_with_pass_through("cache:shop:", 404_u64, |_| async { Ok(None) }, Duration::from_secs(30))
        .await?;
    tracing::info!(?missing, "Missing shop lookup (cached as null)");

    tracing::info!(cache = ?client.stats(), lock = ?system.lock().stats(), "Statistics");
    Ok(())
}
