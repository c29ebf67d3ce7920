//! Seckill purchase flow
//!
//! [`VoucherOrderService::purchase`] is the outer orchestration: advisory
//! checks on the voucher, then the per-user lock. Inside the lock,
//! [`VoucherOrderService::create_voucher_order`] runs the authoritative
//! steps in one explicit store transaction:
//!
//! ```text
//! count_orders(user, voucher) > 0   -> AlreadyPurchased
//! decrement_stock(voucher) == 0     -> OutOfStock
//! next_id("order"), insert_order    -> order id
//! ```
//!
//! The lock only stops one user from racing themselves. Oversell protection
//! comes from the conditional decrement, which is atomic in the store no
//! matter which process issues it.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache_client::CacheClient;
use crate::config::SeckillConfig;
use crate::error::{Error, Result};
use crate::lock::DistributedLock;
use crate::model::{SeckillPhase, SeckillVoucher, VoucherOrder};
use crate::sequence::SequenceGenerator;
use crate::traits::{StoreTransaction, VoucherStore};

/// Identity of the caller, resolved by the request layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: u64,
}

impl RequestContext {
    #[must_use]
    pub fn new(user_id: u64) -> Self {
        Self { user_id }
    }
}

/// Places seckill voucher orders
pub struct VoucherOrderService {
    store: Arc<dyn VoucherStore>,
    lock: Arc<DistributedLock>,
    ids: Arc<SequenceGenerator>,
    voucher_cache: Option<Arc<CacheClient>>,
    config: SeckillConfig,
}

impl VoucherOrderService {
    pub fn new(
        store: Arc<dyn VoucherStore>,
        lock: Arc<DistributedLock>,
        ids: Arc<SequenceGenerator>,
        config: SeckillConfig,
    ) -> Self {
        Self {
            store,
            lock,
            ids,
            voucher_cache: None,
            config,
        }
    }

    /// Read vouchers through `cache` (pass-through strategy)
    ///
    /// Only takes effect when `voucher_cache_ttl` is set in the config.
    #[must_use]
    pub fn with_voucher_cache(mut self, cache: Arc<CacheClient>) -> Self {
        self.voucher_cache = Some(cache);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SeckillConfig {
        &self.config
    }

    /// Buy one unit of `voucher_id` for the caller
    ///
    /// # Returns
    ///
    /// The id of the new order.
    ///
    /// # Errors
    ///
    /// - `NotFound` when the voucher doesn't exist
    /// - `SeckillNotStarted` / `SeckillEnded` outside the sale window
    /// - `OutOfStock` when sold out (advisory check or atomic decrement)
    /// - `DuplicateOrderRejected` while another request of the same user is
    ///   in flight
    /// - `AlreadyPurchased` when the user already owns an order
    /// - `StoreUnavailable` / `CacheUnavailable` / `CapacityExhausted` on
    ///   infrastructure failure; the transaction is rolled back
    pub async fn purchase(&self, ctx: &RequestContext, voucher_id: u64) -> Result<u64> {
        let user_id = ctx.user_id;
        let voucher = self
            .load_voucher(voucher_id)
            .await?
            .ok_or_else(|| Error::not_found("seckill voucher", voucher_id))?;

        // advisory: rejects obviously hopeless requests before any lock traffic
        match voucher.phase_at(Utc::now()) {
            SeckillPhase::NotStarted => return Err(Error::SeckillNotStarted { voucher_id }),
            SeckillPhase::Closed => return Err(Error::SeckillEnded { voucher_id }),
            SeckillPhase::Open => {}
        }
        if !voucher.has_stock() {
            return Err(Error::OutOfStock { voucher_id });
        }

        let resource = format!("order:{user_id}");
        let Some(handle) = self.lock.acquire(&resource, self.config.order_lock_ttl).await? else {
            debug!(user_id, voucher_id, "Purchase already in flight for user");
            return Err(Error::DuplicateOrderRejected { user_id });
        };

        // a cancelled or panicking order drops `handle`, which releases it
        let outcome = self.create_voucher_order(user_id, voucher_id).await;
        self.lock.release_logged(handle).await;
        outcome
    }

    /// Authoritative purchase steps in one store transaction
    ///
    /// Callers must hold the per-user lock. Commits on success; on any error
    /// the transaction is rolled back and the error returned.
    ///
    /// # Errors
    ///
    /// `AlreadyPurchased`, `OutOfStock`, or an infrastructure failure.
    pub async fn create_voucher_order(&self, user_id: u64, voucher_id: u64) -> Result<u64> {
        let mut tx = self.store.begin().await?;

        match self.persist_order(&mut *tx, user_id, voucher_id).await {
            Ok(order) => {
                tx.commit().await?;
                info!(order_id = order.id, user_id, voucher_id, "Seckill order created");
                Ok(order.id)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(user_id, voucher_id, error = %rollback_err, "Rollback of failed purchase failed");
                }
                Err(e)
            }
        }
    }

    async fn persist_order(
        &self,
        tx: &mut dyn StoreTransaction,
        user_id: u64,
        voucher_id: u64,
    ) -> Result<VoucherOrder> {
        if tx.count_orders(user_id, voucher_id).await? > 0 {
            return Err(Error::AlreadyPurchased { user_id, voucher_id });
        }

        if tx.decrement_stock(voucher_id).await? == 0 {
            debug!(voucher_id, "Conditional stock decrement hit zero rows");
            return Err(Error::OutOfStock { voucher_id });
        }

        let order = VoucherOrder {
            id: self.ids.next_id(&self.config.order_id_prefix).await?,
            user_id,
            voucher_id,
            created_at: Utc::now(),
        };
        tx.insert_order(&order).await?;
        Ok(order)
    }

    async fn load_voucher(&self, voucher_id: u64) -> Result<Option<SeckillVoucher>> {
        match (&self.voucher_cache, self.config.voucher_cache_ttl) {
            (Some(cache), Some(ttl)) => {
                let store = Arc::clone(&self.store);
                cache
                    .query_with_pass_through(
                        &self.config.voucher_cache_prefix,
                        voucher_id,
                        |id| async move { store.seckill_voucher(id).await },
                        ttl,
                    )
                    .await
            }
            _ => self.store.seckill_voucher(voucher_id).await,
        }
    }
}
