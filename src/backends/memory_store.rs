//! In-memory voucher store
//!
//! A [`VoucherStore`] whose transactions apply writes immediately under a
//! mutex and keep an undo log; `rollback` (or dropping an uncommitted
//! transaction) replays the log backwards. The conditional stock decrement
//! and the unique `(user_id, voucher_id)` index are checked under the same
//! mutex, so they hold no matter how transactions interleave.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{SeckillVoucher, VoucherOrder};
use crate::traits::{StoreTransaction, VoucherStore};

#[derive(Debug, Default)]
struct Tables {
    vouchers: HashMap<u64, SeckillVoucher>,
    orders: HashMap<u64, VoucherOrder>,
    /// unique index over `(user_id, voucher_id)`
    order_owners: HashSet<(u64, u64)>,
}

#[derive(Debug)]
enum Undo {
    RestoreStock { voucher_id: u64 },
    DeleteOrder { order_id: u64, user_id: u64, voucher_id: u64 },
}

impl Tables {
    fn undo(&mut self, step: Undo) {
        match step {
            Undo::RestoreStock { voucher_id } => {
                if let Some(voucher) = self.vouchers.get_mut(&voucher_id) {
                    voucher.stock = voucher.stock.saturating_add(1);
                }
            }
            Undo::DeleteOrder {
                order_id,
                user_id,
                voucher_id,
            } => {
                self.orders.remove(&order_id);
                self.order_owners.remove(&(user_id, voucher_id));
            }
        }
    }
}

/// Voucher store kept in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_order_inserts: Arc<AtomicBool>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a voucher row
    pub fn insert_voucher(&self, voucher: SeckillVoucher) {
        self.tables.lock().vouchers.insert(voucher.voucher_id, voucher);
    }

    /// Current stock of a voucher
    #[must_use]
    pub fn stock(&self, voucher_id: u64) -> Option<u32> {
        self.tables.lock().vouchers.get(&voucher_id).map(|v| v.stock)
    }

    /// Committed and in-flight orders for a voucher
    #[must_use]
    pub fn orders_for(&self, voucher_id: u64) -> Vec<VoucherOrder> {
        let mut orders: Vec<VoucherOrder> = self
            .tables
            .lock()
            .orders
            .values()
            .filter(|order| order.voucher_id == voucher_id)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.id);
        orders
    }

    /// Make every following `insert_order` fail with `StoreUnavailable`
    pub fn fail_order_inserts(&self, fail: bool) {
        self.fail_order_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoucherStore for MemoryStore {
    async fn seckill_voucher(&self, voucher_id: u64) -> Result<Option<SeckillVoucher>> {
        Ok(self.tables.lock().vouchers.get(&voucher_id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            fail_order_inserts: Arc::clone(&self.fail_order_inserts),
            undo_log: Vec::new(),
        }))
    }
}

/// Transaction handle of [`MemoryStore`]
struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    fail_order_inserts: Arc<AtomicBool>,
    undo_log: Vec<Undo>,
}

impl MemoryTransaction {
    fn undo_all(&mut self) {
        if self.undo_log.is_empty() {
            return;
        }
        let mut tables = self.tables.lock();
        while let Some(step) = self.undo_log.pop() {
            tables.undo(step);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn count_orders(&mut self, user_id: u64, voucher_id: u64) -> Result<u64> {
        let tables = self.tables.lock();
        Ok(u64::from(tables.order_owners.contains(&(user_id, voucher_id))))
    }

    async fn decrement_stock(&mut self, voucher_id: u64) -> Result<u64> {
        let mut tables = self.tables.lock();
        match tables.vouchers.get_mut(&voucher_id) {
            Some(voucher) if voucher.stock > 0 => {
                voucher.stock -= 1;
                self.undo_log.push(Undo::RestoreStock { voucher_id });
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()> {
        if self.fail_order_inserts.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!(
                "insert of order {} rejected",
                order.id
            )));
        }

        let mut tables = self.tables.lock();
        if !tables.order_owners.insert((order.user_id, order.voucher_id)) {
            return Err(Error::AlreadyPurchased {
                user_id: order.user_id,
                voucher_id: order.voucher_id,
            });
        }
        tables.orders.insert(order.id, order.clone());
        self.undo_log.push(Undo::DeleteOrder {
            order_id: order.id,
            user_id: order.user_id,
            voucher_id: order.voucher_id,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        debug!(writes = tx.undo_log.len(), "[MemoryStore] Committed transaction");
        tx.undo_log.clear();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        debug!(writes = tx.undo_log.len(), "[MemoryStore] Rolled back transaction");
        tx.undo_all();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.undo_log.is_empty() {
            warn!(writes = self.undo_log.len(), "[MemoryStore] Transaction dropped uncommitted, rolling back");
            self.undo_all();
        }
    }
}
