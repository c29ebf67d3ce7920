//! Distributed, time-ordered id generator.
//!
//! An id is `(seconds since the custom epoch) << 32 | daily counter`. The
//! counter comes from an atomic `INCR` on `<namespace>:<prefix>:<yyyy:MM:dd>`,
//! so it restarts every UTC day simply because the key changes.
//!
//! Uniqueness rests on the counter alone. The timestamp only gives coarse
//! ordering, and clock skew between processes weakens that ordering but
//! never produces duplicates.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::SequenceConfig;
use crate::error::{Error, Result};
use crate::traits::RemoteCache;

/// Bits reserved for the daily counter
pub const COUNT_BITS: u32 = 32;

/// Timestamp and counter recovered from an id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Whole seconds since the custom epoch
    pub timestamp: u64,
    /// Position within the day of the allocating key
    pub count: u32,
}

impl IdParts {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_id(id: u64) -> Self {
        Self {
            timestamp: id >> COUNT_BITS,
            count: (id & u64::from(u32::MAX)) as u32,
        }
    }

    /// Wall-clock second the id was allocated in
    #[must_use]
    pub fn issued_at(&self, begin_timestamp: i64) -> Option<DateTime<Utc>> {
        let offset = i64::try_from(self.timestamp).ok()?;
        Utc.timestamp_opt(begin_timestamp.checked_add(offset)?, 0).single()
    }
}

/// Allocates ids unique across every process sharing the remote cache
pub struct SequenceGenerator {
    cache: Arc<dyn RemoteCache>,
    config: SequenceConfig,
}

impl SequenceGenerator {
    pub fn new(cache: Arc<dyn RemoteCache>) -> Self {
        Self::with_config(cache, SequenceConfig::default())
    }

    pub fn with_config(cache: Arc<dyn RemoteCache>, config: SequenceConfig) -> Self {
        Self { cache, config }
    }

    #[must_use]
    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    /// Counter key for `prefix` on the UTC day of `now`
    #[must_use]
    pub fn counter_key(&self, prefix: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}:{}:{}",
            self.config.key_namespace,
            prefix,
            now.format("%Y:%m:%d")
        )
    }

    /// Next id for `prefix`
    ///
    /// # Errors
    ///
    /// - `CacheUnavailable` when the counter can't be incremented
    /// - `CapacityExhausted` once a day key passes `u32::MAX` allocations
    /// - `ClockBeforeEpoch` when the local clock reads before the epoch
    pub async fn next_id(&self, prefix: &str) -> Result<u64> {
        self.next_id_at(prefix, Utc::now()).await
    }

    /// Next id for `prefix` as if the clock read `now`
    ///
    /// # Errors
    ///
    /// Same as [`next_id`](Self::next_id).
    pub async fn next_id_at(&self, prefix: &str, now: DateTime<Utc>) -> Result<u64> {
        let epoch = self.config.begin_timestamp;
        let timestamp = u64::try_from(now.timestamp() - epoch).map_err(|_| Error::ClockBeforeEpoch {
            now: now.timestamp(),
            epoch,
        })?;

        let key = self.counter_key(prefix, now);
        let count = self.cache.increment(&key).await?;
        let count = u32::try_from(count).map_err(|_| {
            error!(key = %key, count, "Daily id counter exhausted");
            Error::CapacityExhausted {
                key: key.clone(),
                count,
            }
        })?;

        let id = (timestamp << COUNT_BITS) | u64::from(count);
        debug!(key = %key, id, "Allocated id");
        Ok(id)
    }
}
