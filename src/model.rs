//! Flash-sale entities
//!
//! `SeckillVoucher` stock is only ever changed through
//! [`StoreTransaction::decrement_stock`](crate::traits::StoreTransaction::decrement_stock);
//! `VoucherOrder` is written once and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a seckill window relative to a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeckillPhase {
    /// `now < begin_time`
    NotStarted,
    /// `begin_time <= now <= end_time`
    Open,
    /// `now > end_time`
    Closed,
}

/// A limited-stock, time-boxed voucher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillVoucher {
    pub voucher_id: u64,
    pub stock: u32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    #[must_use]
    pub fn new(voucher_id: u64, stock: u32, begin_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            voucher_id,
            stock,
            begin_time,
            end_time,
        }
    }

    /// Phase of the sale window at `now`
    #[must_use]
    pub fn phase_at(&self, now: DateTime<Utc>) -> SeckillPhase {
        if now < self.begin_time {
            SeckillPhase::NotStarted
        } else if now > self.end_time {
            SeckillPhase::Closed
        } else {
            SeckillPhase::Open
        }
    }

    #[must_use]
    pub fn has_stock(&self) -> bool {
        self.stock > 0
    }
}

/// A successful purchase; at most one exists per `(user_id, voucher_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOrder {
    pub id: u64,
    pub user_id: u64,
    pub voucher_id: u64,
    pub created_at: DateTime<Utc>,
}
