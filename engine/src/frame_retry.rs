//! Materialising FRAME order lines.
//!
//! FRAME capacity is a shared quota, so a line may not fit at the moment its
//! order is placed. This service revisits under-fulfilled lines and grants
//! whatever now fits. Orders placed earlier always have first claim on the
//! quota (see [`frame_line_fit`]).

use crate::publisher::OutboxPublisher;
use allotment_core::capacity::{frame_fulfilment, frame_line_fit};
use allotment_core::environment::Clock;
use allotment_core::error::AllocationError;
use allotment_core::event::InventoryEvent;
use allotment_core::ids::{OrderId, ProductId};
use allotment_core::model::{AllocationPolicy, OrderStatus};
use allotment_core::store::{AllocationStore, Isolation, UnitOfWork};
use std::sync::Arc;
use tracing::{error, info};

/// Progress made on one order's FRAME lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderFrameProgress {
    /// Order that was retried
    pub order_id: OrderId,
    /// Lines whose fulfilled quantity grew, with the new value
    pub progressed: Vec<(ProductId, i64)>,
    /// Units still pending across the order's FRAME lines
    pub remaining: i64,
}

impl OrderFrameProgress {
    /// Whether every FRAME line of the order is now fulfilled.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Totals of one sweep over all pending orders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameRetrySummary {
    /// Orders looked at
    pub orders_examined: u64,
    /// Lines that received more units
    pub lines_progressed: u64,
    /// Orders whose FRAME lines are now complete
    pub orders_completed: u64,
    /// Orders whose retry failed and were skipped
    pub failures: u64,
}

/// Retries under-fulfilled FRAME lines, oldest order first.
pub struct FrameAllocationRetryService<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: AllocationStore> FrameAllocationRetryService<S> {
    /// Create a retry service over `store`.
    #[must_use]
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Grant as much of one order's pending FRAME quantity as now fits.
    ///
    /// Lines that still do not fit stay pending for a later retry.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::OrderNotFound`] if the order does not exist
    /// - [`AllocationError::AlreadyCancelled`] if the order was cancelled
    /// - [`AllocationError::Store`] on storage failure
    #[tracing::instrument(skip_all, fields(order_id = %order_id))]
    pub async fn allocate_pending_by_order_id(
        &self,
        order_id: OrderId,
    ) -> Result<OrderFrameProgress, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;

        let order = uow
            .lock_order(order_id)
            .await?
            .ok_or(AllocationError::OrderNotFound(order_id))?;
        if order.status == OrderStatus::Cancelled {
            return Err(AllocationError::AlreadyCancelled(order_id));
        }

        let mut items = order.items.clone();
        items.sort_by_key(|item| item.product_id);

        let publisher = OutboxPublisher::new().with("order_id", order_id.to_string());
        let mut progress = OrderFrameProgress {
            order_id,
            ..OrderFrameProgress::default()
        };
        for item in items.iter().filter(|item| item.pending() > 0) {
            let Some(product) = uow.find_product(item.product_id).await? else {
                continue;
            };
            if product.policy != AllocationPolicy::Frame {
                continue;
            }

            let limit = uow.lock_sales_limit(item.product_id, now).await?;
            let claims = uow.frame_claims(item.product_id).await?;
            let fit = frame_line_fit(limit.sales_limit_total, &claims, order.id, order.placed_at);
            let fulfilled = frame_fulfilment(item.fulfilled_quantity, item.quantity, fit);

            if fulfilled > item.fulfilled_quantity {
                uow.set_fulfilled_quantity(item.id, fulfilled).await?;
                publisher
                    .publish(
                        &mut uow,
                        &InventoryEvent::FrameAllocationProgressed {
                            order_id,
                            product_id: item.product_id,
                            fulfilled,
                            remaining: item.quantity - fulfilled,
                        },
                        now,
                    )
                    .await?;
                progress.progressed.push((item.product_id, fulfilled));
            }
            progress.remaining += item.quantity - fulfilled;
        }
        uow.commit().await?;

        metrics::counter!("allocation.frame_retry.lines_progressed")
            .increment(u64::try_from(progress.progressed.len()).unwrap_or(u64::MAX));
        info!(
            lines_progressed = progress.progressed.len(),
            remaining = progress.remaining,
            "FRAME allocation retried"
        );
        Ok(progress)
    }

    /// Retry every order with pending FRAME lines, oldest first.
    ///
    /// A failing order is logged and skipped; the sweep continues.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Store`] if the pending orders cannot be listed.
    #[tracing::instrument(skip_all)]
    pub async fn allocate_all_pending(&self) -> Result<FrameRetrySummary, AllocationError> {
        let pending = {
            let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
            let pending = uow.orders_with_pending_frame_lines().await?;
            uow.commit().await?;
            pending
        };

        let mut summary = FrameRetrySummary::default();
        for order_id in pending {
            summary.orders_examined += 1;
            match self.allocate_pending_by_order_id(order_id).await {
                Ok(progress) => {
                    summary.lines_progressed += progress.progressed.len() as u64;
                    if progress.is_complete() {
                        summary.orders_completed += 1;
                    }
                },
                Err(e) => {
                    error!(order_id = %order_id, error = %e, "FRAME retry failed for order");
                    summary.failures += 1;
                },
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allotment_testing::{InMemoryAllocationStore, fixtures, test_clock};

    #[tokio::test]
    async fn real_lines_are_left_alone() {
        let store = InMemoryAllocationStore::new();
        let now = test_clock().now();
        let mug = fixtures::real_product("Mug");
        store.add_product(mug.clone()).await;
        let order = fixtures::pending_order(now, &[(mug.id, 3)]);
        store.add_order(order.clone()).await;

        let service = FrameAllocationRetryService::new(store.clone(), Arc::new(test_clock()));
        let progress = service.allocate_pending_by_order_id(order.id).await;

        assert!(matches!(progress, Ok(ref p) if p.progressed.is_empty() && p.is_complete()));
        assert!(store.outbox().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_reported() {
        let store = InMemoryAllocationStore::new();
        let service = FrameAllocationRetryService::new(store, Arc::new(test_clock()));
        let missing = OrderId::new();

        let result = service.allocate_pending_by_order_id(missing).await;
        assert!(matches!(result, Err(AllocationError::OrderNotFound(id)) if id == missing));
    }
}
