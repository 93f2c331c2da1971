//! Available-to-promise.
//!
//! ```text
//! REAL   effective = max(0, remaining(LocationStock) - Σ active holds)
//! FRAME  effective = max(0, sales_limit_total - Σ ordered qty (non-cancelled) - Σ active holds)
//! ```
//!
//! A hold is active while `expires_at > now`; expired rows stop counting
//! before the sweep deletes them.

use crate::policy::PolicyLedger;
use allotment_core::capacity::effective_stock;
use allotment_core::environment::Clock;
use allotment_core::error::AllocationError;
use allotment_core::ids::{LocationId, OrderId, ProductId};
use allotment_core::store::{AllocationStore, Isolation, StoreError, UnitOfWork};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Effective stock of an already-loaded ledger, inside an open unit of work.
///
/// # Errors
///
/// Returns [`StoreError`] if the consumed or held sums cannot be read.
pub async fn effective_stock_in<U: UnitOfWork>(
    uow: &mut U,
    ledger: &PolicyLedger,
    exclude_order: Option<OrderId>,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let capacity = ledger.capacity_remaining(uow, exclude_order).await?;
    let held = uow.active_tentative_total(ledger.product_id(), now).await?;
    Ok(effective_stock(capacity, held))
}

/// Read-only effective stock queries.
///
/// Takes no locks: the answer is a point-in-time estimate for display, the
/// engine re-checks under lock before it grants anything.
pub struct EffectiveStockCalculator<S> {
    store: S,
    clock: Arc<dyn Clock>,
    location_id: LocationId,
}

impl<S: AllocationStore> EffectiveStockCalculator<S> {
    /// Create a calculator reading the given location.
    #[must_use]
    pub fn new(store: S, clock: Arc<dyn Clock>, location_id: LocationId) -> Self {
        Self {
            store,
            clock,
            location_id,
        }
    }

    /// Quantity a new shopper could reserve right now.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::ItemNotFound`] if the product does not exist
    /// - [`AllocationError::Store`] on storage failure
    pub async fn effective_stock(&self, product_id: ProductId) -> Result<i64, AllocationError> {
        self.compute(product_id, None).await
    }

    /// Like [`effective_stock`](Self::effective_stock), leaving one order's
    /// lines out of the FRAME consumed sum.
    ///
    /// # Errors
    ///
    /// Same as [`effective_stock`](Self::effective_stock).
    pub async fn effective_stock_excluding_order(
        &self,
        product_id: ProductId,
        order_id: OrderId,
    ) -> Result<i64, AllocationError> {
        self.compute(product_id, Some(order_id)).await
    }

    /// Effective stock for several products from one consistent snapshot.
    ///
    /// # Errors
    ///
    /// Fails with [`AllocationError::ItemNotFound`] on the first unknown product.
    pub async fn effective_stocks(
        &self,
        product_ids: &[ProductId],
    ) -> Result<Vec<(ProductId, i64)>, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::RepeatableRead).await?;
        let mut stocks = Vec::with_capacity(product_ids.len());
        for &product_id in product_ids {
            let product = uow
                .find_product(product_id)
                .await?
                .ok_or(AllocationError::ItemNotFound(product_id))?;
            let ledger = PolicyLedger::read(&mut uow, &product, self.location_id, now).await?;
            stocks.push((product_id, effective_stock_in(&mut uow, &ledger, None, now).await?));
        }
        uow.commit().await?;
        Ok(stocks)
    }

    async fn compute(
        &self,
        product_id: ProductId,
        exclude_order: Option<OrderId>,
    ) -> Result<i64, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let product = uow
            .find_product(product_id)
            .await?
            .ok_or(AllocationError::ItemNotFound(product_id))?;
        let ledger = PolicyLedger::read(&mut uow, &product, self.location_id, now).await?;
        let stock = effective_stock_in(&mut uow, &ledger, exclude_order, now).await?;
        uow.commit().await?;
        Ok(stock)
    }
}
