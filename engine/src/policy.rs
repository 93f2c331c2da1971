//! Ledger strategy per allocation policy.
//!
//! A product's policy is looked up once and turned into a [`PolicyLedger`];
//! callers then ask it for remaining capacity and let it apply commits and
//! releases without branching on the policy themselves.
//!
//! The two variants keep different bookkeeping: REAL caches a
//! counter (`allocated_qty`) that the consistency audit checks, FRAME derives
//! consumption from live order lines every time it is asked.

use allotment_core::capacity::real_fulfilment;
use allotment_core::event::{CommittedLine, ReleasedLine};
use allotment_core::ids::{LocationId, OrderId, ProductId};
use allotment_core::model::{
    AdjustmentTarget, AllocationPolicy, LocationStock, OrderItem, Product, SalesLimit,
    StockReservation,
};
use allotment_core::store::{StoreError, UnitOfWork};
use chrono::{DateTime, Utc};

/// The ledger row backing one product, loaded for the current unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyLedger {
    /// Physical stock at a location.
    Real(LocationStock),
    /// Sales quota; consumption is derived from orders.
    Frame(SalesLimit),
}

impl PolicyLedger {
    /// Lock the product's ledger row, creating it if needed.
    ///
    /// The lock is held until the unit of work ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be created or locked.
    pub async fn lock<U: UnitOfWork>(
        uow: &mut U,
        product: &Product,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        match product.policy {
            AllocationPolicy::Real => Ok(Self::Real(
                uow.lock_location_stock(product.id, location_id, now).await?,
            )),
            AllocationPolicy::Frame => Ok(Self::Frame(uow.lock_sales_limit(product.id, now).await?)),
        }
    }

    /// Read the product's ledger row without locking; a missing row reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub async fn read<U: UnitOfWork>(
        uow: &mut U,
        product: &Product,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        match product.policy {
            AllocationPolicy::Real => Ok(Self::Real(
                uow.find_location_stock(product.id, location_id)
                    .await?
                    .unwrap_or_else(|| LocationStock::empty(product.id, location_id, now)),
            )),
            AllocationPolicy::Frame => Ok(Self::Frame(
                uow.find_sales_limit(product.id)
                    .await?
                    .unwrap_or_else(|| SalesLimit::empty(product.id, now)),
            )),
        }
    }

    /// Policy of this ledger.
    #[must_use]
    pub const fn policy(&self) -> AllocationPolicy {
        match self {
            Self::Real(_) => AllocationPolicy::Real,
            Self::Frame(_) => AllocationPolicy::Frame,
        }
    }

    /// Product this ledger belongs to.
    #[must_use]
    pub const fn product_id(&self) -> ProductId {
        match self {
            Self::Real(row) => row.product_id,
            Self::Frame(row) => row.product_id,
        }
    }

    /// The admin-controlled total: `allocatable_qty` or `sales_limit_total`.
    #[must_use]
    pub const fn capacity_total(&self) -> i64 {
        match self {
            Self::Real(row) => row.allocatable_qty,
            Self::Frame(row) => row.sales_limit_total,
        }
    }

    /// Which field an admin edit of this ledger touches.
    #[must_use]
    pub const fn adjustment_target(&self) -> AdjustmentTarget {
        match self {
            Self::Real(_) => AdjustmentTarget::AllocatableQuantity,
            Self::Frame(_) => AdjustmentTarget::SalesLimitTotal,
        }
    }

    /// Capacity not yet committed to orders, never negative.
    ///
    /// For FRAME, `exclude_order` leaves one order's lines out of the consumed
    /// sum so an order being committed or retried does not block itself.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the consumed sum cannot be read.
    pub async fn capacity_remaining<U: UnitOfWork>(
        &self,
        uow: &mut U,
        exclude_order: Option<OrderId>,
    ) -> Result<i64, StoreError> {
        match self {
            Self::Real(row) => Ok(row.remaining()),
            Self::Frame(row) => {
                let consumed = uow.frame_consumed(row.product_id, exclude_order).await?;
                Ok(row.headroom(consumed))
            },
        }
    }

    /// Overwrite the admin-controlled total.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn set_capacity_total<U: UnitOfWork>(
        &mut self,
        uow: &mut U,
        total: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self {
            Self::Real(row) => {
                row.allocatable_qty = total;
                row.updated_at = now;
                uow.save_location_stock(row).await
            },
            Self::Frame(row) => {
                row.sales_limit_total = total;
                row.updated_at = now;
                uow.save_sales_limit(row).await
            },
        }
    }

    /// Move a validated tentative hold onto `item` and delete the hold.
    ///
    /// REAL pivots the hold to a committed row, bumps `allocated_qty` and
    /// records the fulfilled quantity. FRAME writes nothing to the ledger and
    /// leaves the line at zero for the retry service to materialise.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any write fails.
    pub async fn apply_commit<U: UnitOfWork>(
        &mut self,
        uow: &mut U,
        item: &OrderItem,
        mut hold: StockReservation,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<CommittedLine, StoreError> {
        let policy = self.policy();
        let fulfilled_quantity = match self {
            Self::Real(row) => {
                hold.commit_to(order_id, now);
                uow.update_reservation(&hold).await?;

                row.allocated_qty += hold.quantity;
                row.updated_at = now;
                uow.save_location_stock(row).await?;

                real_fulfilment(item.quantity, item.fulfilled_quantity, hold.quantity)
            },
            Self::Frame(_) => 0,
        };

        uow.set_fulfilled_quantity(item.id, fulfilled_quantity).await?;
        uow.delete_reservation(hold.id).await?;

        Ok(CommittedLine {
            product_id: item.product_id,
            policy,
            quantity: hold.quantity,
            fulfilled_quantity,
        })
    }

    /// Give back what a cancelled order line held.
    ///
    /// Returns `None` when the line held nothing. Must run before the order's
    /// status changes so FRAME can measure the drop in derived consumption.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any read or write fails.
    pub async fn apply_release<U: UnitOfWork>(
        &mut self,
        uow: &mut U,
        item: &OrderItem,
        now: DateTime<Utc>,
    ) -> Result<Option<ReleasedLine>, StoreError> {
        match self {
            Self::Real(row) => {
                if item.fulfilled_quantity <= 0 {
                    return Ok(None);
                }
                let before = row.remaining();
                row.allocated_qty = (row.allocated_qty - item.fulfilled_quantity).max(0);
                row.updated_at = now;
                uow.save_location_stock(row).await?;
                uow.set_fulfilled_quantity(item.id, 0).await?;

                Ok(Some(ReleasedLine {
                    product_id: item.product_id,
                    policy: AllocationPolicy::Real,
                    freed: item.fulfilled_quantity,
                    availability_increase: row.remaining() - before,
                }))
            },
            Self::Frame(row) => {
                let with_order = uow.frame_consumed(row.product_id, None).await?;
                let without_order = uow.frame_consumed(row.product_id, Some(item.order_id)).await?;
                if item.fulfilled_quantity > 0 {
                    uow.set_fulfilled_quantity(item.id, 0).await?;
                }

                Ok(Some(ReleasedLine {
                    product_id: item.product_id,
                    policy: AllocationPolicy::Frame,
                    freed: item.fulfilled_quantity,
                    availability_increase: row.headroom(without_order) - row.headroom(with_order),
                }))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allotment_core::ids::SessionId;
    use allotment_core::model::OrderStatus;
    use allotment_core::store::{AllocationStore, Isolation};
    use allotment_testing::{InMemoryAllocationStore, fixtures, test_clock};
    use allotment_core::environment::Clock;

    #[tokio::test]
    async fn frame_capacity_excludes_the_order_under_review() {
        let store = InMemoryAllocationStore::new();
        let now = test_clock().now();
        let poster = fixtures::frame_product("Poster");
        store.add_product(poster.clone()).await;
        store.set_sales_limit(poster.id, 20).await;
        let other = fixtures::fulfilled_order(now, &[(poster.id, 15)]);
        let mine = fixtures::pending_order(now, &[(poster.id, 6)]);
        store.add_order(other).await;
        store.add_order(mine.clone()).await;

        let Ok(mut uow) = store.begin(Isolation::ReadCommitted).await else {
            unreachable!("in-memory begin never fails");
        };
        let ledger = PolicyLedger::lock(&mut uow, &poster, LocationId::DEFAULT, now)
            .await
            .unwrap_or_else(|_| PolicyLedger::Frame(SalesLimit::empty(poster.id, now)));

        assert_eq!(ledger.capacity_remaining(&mut uow, Some(mine.id)).await.ok(), Some(5));
        assert_eq!(ledger.capacity_remaining(&mut uow, None).await.ok(), Some(0));
    }

    #[tokio::test]
    async fn real_release_floors_allocated_at_zero() {
        let store = InMemoryAllocationStore::new();
        let now = test_clock().now();
        let mug = fixtures::real_product("Mug");
        store.add_product(mug.clone()).await;
        store.set_location_stock(mug.id, 10, 2).await;
        let order = fixtures::fulfilled_order(now, &[(mug.id, 5)]);
        store.add_order(order.clone()).await;

        let Ok(mut uow) = store.begin(Isolation::ReadCommitted).await else {
            unreachable!("in-memory begin never fails");
        };
        let Ok(mut ledger) = PolicyLedger::lock(&mut uow, &mug, LocationId::DEFAULT, now).await
        else {
            unreachable!("in-memory lock never fails");
        };
        let released = ledger
            .apply_release(&mut uow, &order.items[0], now)
            .await
            .ok()
            .flatten();

        assert_eq!(released.map(|line| (line.freed, line.availability_increase)), Some((5, 2)));
        assert_eq!(ledger.capacity_remaining(&mut uow, None).await.ok(), Some(10));
    }

    #[tokio::test]
    async fn frame_commit_leaves_line_unfulfilled() {
        let store = InMemoryAllocationStore::new();
        let now = test_clock().now();
        let poster = fixtures::frame_product("Poster");
        store.add_product(poster.clone()).await;
        let order = fixtures::pending_order(now, &[(poster.id, 2)]);
        store.add_order(order.clone()).await;
        let hold = StockReservation::tentative(
            poster.id,
            SessionId::from("s"),
            2,
            now,
            now + chrono::Duration::minutes(30),
        );
        store.put_reservation(hold.clone()).await;

        let Ok(mut uow) = store.begin(Isolation::ReadCommitted).await else {
            unreachable!("in-memory begin never fails");
        };
        let Ok(mut ledger) = PolicyLedger::lock(&mut uow, &poster, LocationId::DEFAULT, now).await
        else {
            unreachable!("in-memory lock never fails");
        };
        let line = ledger
            .apply_commit(&mut uow, &order.items[0], hold, order.id, now)
            .await;
        assert!(uow.commit().await.is_ok());

        assert!(matches!(line, Ok(CommittedLine { fulfilled_quantity: 0, quantity: 2, .. })));
        assert!(store.reservations().await.is_empty());
        let stored = store.order(order.id).await;
        assert_eq!(stored.map(|o| o.status), Some(OrderStatus::Pending));
    }
}
