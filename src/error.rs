//! Error taxonomy for the flash-sale core.
//!
//! Business-rule rejections (`SeckillNotStarted`, `OutOfStock`, ...) are
//! expected outcomes and come back as ordinary `Err` values that the HTTP
//! layer turns into user-facing messages. Infrastructure failures
//! (`StoreUnavailable`, `CacheUnavailable`, ...) abort the current request.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the cache layer, id generator and purchase flow can report
#[derive(Debug, Error)]
pub enum Error {
    /// Entity absent in both cache and store
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The seckill window has not opened yet
    #[error("seckill for voucher {voucher_id} has not started")]
    SeckillNotStarted { voucher_id: u64 },

    /// The seckill window is already closed
    #[error("seckill for voucher {voucher_id} has ended")]
    SeckillEnded { voucher_id: u64 },

    /// No stock left (advisory pre-check or the atomic decrement)
    #[error("voucher {voucher_id} is out of stock")]
    OutOfStock { voucher_id: u64 },

    /// Another request of the same user is in flight
    #[error("duplicate order rejected for user {user_id}")]
    DuplicateOrderRejected { user_id: u64 },

    /// The user already owns an order for this voucher
    #[error("user {user_id} already purchased voucher {voucher_id}")]
    AlreadyPurchased { user_id: u64, voucher_id: u64 },

    /// The record-of-truth store failed
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared remote cache failed
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// A cached payload could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The mutex rebuild strategy gave up waiting for another rebuilder
    #[error("cache rebuild of '{key}' still locked after {attempts} attempts")]
    RebuildTimeout { key: String, attempts: u32 },

    /// The daily sequence outgrew the 32-bit counter space
    #[error("sequence '{key}' exhausted: counter {count} does not fit in 32 bits")]
    CapacityExhausted { key: String, count: i64 },

    /// The local clock reads earlier than the id epoch
    #[error("clock reads {now}s, earlier than id epoch {epoch}s")]
    ClockBeforeEpoch { now: i64, epoch: i64 },
}

impl Error {
    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// `true` for business-rule rejections that must never be retried
    /// automatically and are not infrastructure faults.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::SeckillNotStarted { .. }
                | Self::SeckillEnded { .. }
                | Self::OutOfStock { .. }
                | Self::DuplicateOrderRejected { .. }
                | Self::AlreadyPurchased { .. }
        )
    }

    /// `true` for a plain "no data" outcome
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::CacheUnavailable(err.to_string())
    }
}
