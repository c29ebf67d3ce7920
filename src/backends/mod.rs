//! Facade Implementations
//!
//! # Remote Cache
//! - **Redis** - The shared remote cache used in production (feature: `redis`, default)
//! - **`DashMap`** - In-process stand-in with the same atomicity guarantees,
//!   used by tests, benches and single-process deployments
//!
//! # Store
//! - **`MemoryStore`** - In-process voucher store with undo-log transactions
//!
//! # Usage
//!
//! ```rust,no_run
//! use flash_sale::backends::{DashMapCache, MemoryStore, RedisCache};
//!
//! # async fn example() -> flash_sale::Result<()> {
//! let shared = RedisCache::new().await?;   // reads REDIS_URL
//! let local = DashMapCache::new();
//! let store = MemoryStore::new();
//! # Ok(())
//! # }
//! ```

pub mod dashmap_cache;
pub mod memory_store;

#[cfg(feature = "redis")]
pub mod redis_cache;

pub use dashmap_cache::DashMapCache;
pub use memory_store::MemoryStore;

#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;
