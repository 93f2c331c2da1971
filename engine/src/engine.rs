//! The allocation engine.
//!
//! Every public operation runs in exactly one unit of work. Ledger rows are
//! locked before capacity is read, so two operations on the same product
//! serialize while operations on different products proceed in parallel.
//! Any error drops the unit of work, which rolls back ledger, reservation and
//! outbox writes together.
//!
//! Locks are taken in one global order: the order row (commit, cancellation),
//! then ledger rows in product id order.

use crate::calculator::{EffectiveStockCalculator, effective_stock_in};
use crate::policy::PolicyLedger;
use crate::publisher::OutboxPublisher;
use allotment_core::capacity::check_fits;
use allotment_core::environment::Clock;
use allotment_core::error::{AllocationError, Shortage};
use allotment_core::event::{AvailabilityReason, CommittedLine, InventoryEvent, ReleasedLine};
use allotment_core::ids::{AdjustmentId, LocationId, OrderId, ProductId, SessionId};
use allotment_core::model::{
    InventoryAdjustment, OrderItem, OrderStatus, Product, StockReservation,
};
use allotment_core::store::{AllocationStore, Isolation, StoreError, UnitOfWork};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Tunables for the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationSettings {
    /// How long a tentative hold lives after its last change
    pub reservation_ttl: Duration,
    /// Location whose REAL ledger rows are used
    pub location_id: LocationId,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(30),
            location_id: LocationId::DEFAULT,
        }
    }
}

/// A tentative hold together with the effective stock left after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationOutcome {
    /// The created or updated hold
    pub reservation: StockReservation,
    /// Effective stock for other shoppers after this change
    pub effective_stock: i64,
}

/// Result of a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Order the holds were committed to
    pub order_id: OrderId,
    /// Applied lines, in product id order
    pub lines: Vec<CommittedLine>,
}

/// Result of an order cancellation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancellationReceipt {
    /// Cancelled order
    pub order_id: OrderId,
    /// Lines that gave capacity back
    pub released: Vec<ReleasedLine>,
}

/// How an admin edit expresses the new capacity.
#[derive(Clone, Copy, Debug)]
enum CapacityEdit {
    Delta(i64),
    Absolute(i64),
}

/// A validated commit line waiting for the apply pass.
struct CommitPlan {
    hold: StockReservation,
    item: OrderItem,
    ledger: PolicyLedger,
}

/// Reserve, modify, release and commit stock against the ledgers.
pub struct AllocationEngine<S> {
    store: S,
    clock: Arc<dyn Clock>,
    settings: AllocationSettings,
}

impl<S: AllocationStore + Clone> AllocationEngine<S> {
    /// Create an engine over `store`.
    #[must_use]
    pub fn new(store: S, clock: Arc<dyn Clock>, settings: AllocationSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Read-only calculator sharing this engine's store, clock and location.
    #[must_use]
    pub fn calculator(&self) -> EffectiveStockCalculator<S> {
        EffectiveStockCalculator::new(
            self.store.clone(),
            Arc::clone(&self.clock),
            self.settings.location_id,
        )
    }

    /// Current effective stock of a product.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::ItemNotFound`] if the product does not exist
    /// - [`AllocationError::Store`] on storage failure
    pub async fn effective_stock(&self, product_id: ProductId) -> Result<i64, AllocationError> {
        self.calculator().effective_stock(product_id).await
    }

    /// Place a tentative hold of `quantity` units for a session.
    ///
    /// If the session already holds this product the call adds to that hold,
    /// checking only the additional units.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::InvalidQuantity`] if `quantity <= 0`
    /// - [`AllocationError::ItemNotFound`] if the product does not exist
    /// - [`AllocationError::InsufficientStock`] if the units do not fit
    #[tracing::instrument(skip_all, fields(session_id = %session_id, product_id = %product_id, quantity))]
    pub async fn reserve(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<ReservationOutcome, AllocationError> {
        ensure_positive(quantity)?;
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let product = find_product(&mut uow, product_id).await?;
        let ledger = PolicyLedger::lock(&mut uow, &product, self.settings.location_id, now).await?;

        let outcome = match uow.active_tentative(session_id, product_id, now).await? {
            Some(existing) => match existing.quantity.checked_add(quantity) {
                Some(total) => self.resize(&mut uow, &ledger, existing, total, now).await,
                None => match effective_stock_in(&mut uow, &ledger, None, now).await {
                    Ok(available) => Err(AllocationError::InsufficientStock {
                        product_id,
                        requested: quantity,
                        available,
                    }),
                    Err(e) => Err(e.into()),
                },
            },
            None => self.create_hold(&mut uow, &ledger, session_id, quantity, now).await,
        };
        let outcome = record_outcome("reserve", outcome)?;

        uow.commit().await?;
        info!(
            reservation_id = %outcome.reservation.id,
            held = outcome.reservation.quantity,
            effective_stock = outcome.effective_stock,
            "Stock reserved"
        );
        Ok(outcome)
    }

    /// Set a session's hold on a product to `quantity` units and refresh its expiry.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::InvalidQuantity`] if `quantity <= 0`
    /// - [`AllocationError::ItemNotFound`] if the product does not exist
    /// - [`AllocationError::ReservationNotFound`] if the session holds no active reservation
    /// - [`AllocationError::InsufficientStock`] if the increase does not fit
    #[tracing::instrument(skip_all, fields(session_id = %session_id, product_id = %product_id, quantity))]
    pub async fn modify(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<ReservationOutcome, AllocationError> {
        ensure_positive(quantity)?;
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let product = find_product(&mut uow, product_id).await?;
        let ledger = PolicyLedger::lock(&mut uow, &product, self.settings.location_id, now).await?;

        let existing = uow
            .active_tentative(session_id, product_id, now)
            .await?
            .ok_or_else(|| AllocationError::ReservationNotFound {
                session_id: session_id.clone(),
                product_id,
            })?;
        let outcome = record_outcome("modify", self.resize(&mut uow, &ledger, existing, quantity, now).await)?;

        uow.commit().await?;
        info!(
            held = outcome.reservation.quantity,
            effective_stock = outcome.effective_stock,
            "Reservation modified"
        );
        Ok(outcome)
    }

    /// Drop a session's hold on a product. Releasing nothing is not an error.
    ///
    /// Returns whether a hold was removed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Store`] on storage failure.
    #[tracing::instrument(skip_all, fields(session_id = %session_id, product_id = %product_id))]
    pub async fn release(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
    ) -> Result<bool, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let removed = match uow.active_tentative(session_id, product_id, now).await? {
            Some(hold) => uow.delete_reservation(hold.id).await?,
            None => false,
        };
        uow.commit().await?;

        metrics::counter!("allocation.release.total", "removed" => removed.to_string()).increment(1);
        if removed {
            info!("Reservation released");
        }
        Ok(removed)
    }

    /// Drop every tentative hold of a session (cart cleared).
    ///
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Store`] on storage failure.
    #[tracing::instrument(skip_all, fields(session_id = %session_id))]
    pub async fn release_all(&self, session_id: &SessionId) -> Result<u64, AllocationError> {
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let removed = uow.delete_tentatives_for_session(session_id).await?;
        uow.commit().await?;

        info!(removed, "Session reservations released");
        Ok(removed)
    }

    /// Active tentative holds of a session, by product id.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Store`] on storage failure.
    pub async fn session_reservations(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StockReservation>, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let holds = uow.active_tentatives_for_session(session_id, now).await?;
        uow.commit().await?;
        Ok(holds)
    }

    /// Turn every active hold of a session into allocations on `order_id`.
    ///
    /// All lines are validated before any is applied: if one does not fit,
    /// nothing changes and the error lists every short line.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::OrderNotFound`] if the order does not exist
    /// - [`AllocationError::AlreadyCancelled`] if the order was cancelled
    /// - [`AllocationError::NoReservations`] if the session holds nothing
    /// - [`AllocationError::ItemNotFound`] if a held product is missing or not on the order
    /// - [`AllocationError::OutOfStock`] if any line exceeds remaining capacity
    #[tracing::instrument(skip_all, fields(session_id = %session_id, order_id = %order_id))]
    pub async fn commit(
        &self,
        session_id: &SessionId,
        order_id: OrderId,
    ) -> Result<CommitReceipt, AllocationError> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;

        let order = uow
            .lock_order(order_id)
            .await?
            .ok_or(AllocationError::OrderNotFound(order_id))?;
        if order.status == OrderStatus::Cancelled {
            return Err(AllocationError::AlreadyCancelled(order_id));
        }
        let holds = uow.active_tentatives_for_session(session_id, now).await?;
        if holds.is_empty() {
            return Err(AllocationError::NoReservations(session_id.clone()));
        }

        let mut plans = Vec::with_capacity(holds.len());
        let mut shortages = Vec::new();
        for hold in holds {
            let product = find_product(&mut uow, hold.product_id).await?;
            let item = order
                .item_for(product.id)
                .cloned()
                .ok_or(AllocationError::ItemNotFound(product.id))?;
            let ledger =
                PolicyLedger::lock(&mut uow, &product, self.settings.location_id, now).await?;
            let available = ledger.capacity_remaining(&mut uow, Some(order_id)).await?;
            if let Err(available) = check_fits(hold.quantity, available) {
                shortages.push(shortage(&product, hold.quantity, available));
            }
            plans.push(CommitPlan { hold, item, ledger });
        }

        if !shortages.is_empty() {
            warn!(short_lines = shortages.len(), "Commit rejected, nothing applied");
            metrics::counter!("allocation.commit.total", "outcome" => "out_of_stock").increment(1);
            metrics::counter!("allocation.commit.shortages")
                .increment(u64::try_from(shortages.len()).unwrap_or(u64::MAX));
            return Err(AllocationError::OutOfStock { shortages });
        }

        let mut lines = Vec::with_capacity(plans.len());
        for CommitPlan {
            hold,
            item,
            mut ledger,
        } in plans
        {
            lines.push(ledger.apply_commit(&mut uow, &item, hold, order_id, now).await?);
        }

        let receipt = CommitReceipt { order_id, lines };
        OutboxPublisher::new()
            .with("order_id", order_id.to_string())
            .with("session_id", session_id.as_str())
            .publish(
                &mut uow,
                &InventoryEvent::OrderStockCommitted {
                    order_id,
                    session_id: session_id.clone(),
                    lines: receipt.lines.clone(),
                },
                now,
            )
            .await?;
        uow.commit().await?;

        metrics::counter!("allocation.commit.total", "outcome" => "committed").increment(1);
        metrics::histogram!("allocation.commit.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(lines = receipt.lines.len(), "Order stock committed");
        Ok(receipt)
    }

    /// Cancel an order and give its allocations back to the ledgers.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::OrderNotFound`] if the order does not exist
    /// - [`AllocationError::AlreadyCancelled`] if it was cancelled before
    /// - [`AllocationError::OrderNotCancellable`] if it shipped or was delivered
    /// - [`AllocationError::ItemNotFound`] if an ordered product is missing
    #[tracing::instrument(skip_all, fields(order_id = %order_id))]
    pub async fn release_committed(
        &self,
        order_id: OrderId,
    ) -> Result<CancellationReceipt, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;

        let order = uow
            .lock_order(order_id)
            .await?
            .ok_or(AllocationError::OrderNotFound(order_id))?;
        if order.status == OrderStatus::Cancelled {
            return Err(AllocationError::AlreadyCancelled(order_id));
        }
        if order.status.is_terminal() {
            return Err(AllocationError::OrderNotCancellable {
                order_id,
                status: order.status,
            });
        }

        let publisher = OutboxPublisher::new().with("order_id", order_id.to_string());
        let mut items = order.items.clone();
        items.sort_by_key(|item| item.product_id);

        let mut released = Vec::new();
        for item in &items {
            let product = find_product(&mut uow, item.product_id).await?;
            let mut ledger =
                PolicyLedger::lock(&mut uow, &product, self.settings.location_id, now).await?;
            let Some(line) = ledger.apply_release(&mut uow, item, now).await? else {
                continue;
            };
            if line.availability_increase > 0 {
                let increased_by = match ledger {
                    PolicyLedger::Real(_) => line.freed,
                    PolicyLedger::Frame(_) => item.quantity,
                };
                publisher
                    .publish(
                        &mut uow,
                        &InventoryEvent::StockAvailabilityIncreased {
                            product_id: item.product_id,
                            reason: AvailabilityReason::OrderCancelled,
                            increased_by,
                            order_id: Some(order_id),
                        },
                        now,
                    )
                    .await?;
            }
            released.push(line);
        }

        let residual = uow.delete_committed_for_order(order_id).await?;
        uow.set_order_status(order_id, OrderStatus::Cancelled).await?;
        publisher
            .publish(
                &mut uow,
                &InventoryEvent::OrderCancelled {
                    order_id,
                    released: released.clone(),
                },
                now,
            )
            .await?;
        uow.commit().await?;

        metrics::counter!("allocation.cancel.total").increment(1);
        info!(
            released_lines = released.len(),
            residual_pivots = residual,
            "Order cancelled, stock released"
        );
        Ok(CancellationReceipt { order_id, released })
    }

    /// Change a product's capacity by `delta` units.
    ///
    /// Edits `allocatable_qty` for REAL products and `sales_limit_total` for
    /// FRAME products, and records an audit row.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::ItemNotFound`] if the product does not exist
    /// - [`AllocationError::InvalidStockAdjustment`] if the result would be negative
    #[tracing::instrument(skip_all, fields(product_id = %product_id, delta, actor))]
    pub async fn adjust_stock(
        &self,
        product_id: ProductId,
        delta: i64,
        reason: &str,
        actor: &str,
    ) -> Result<InventoryAdjustment, AllocationError> {
        self.edit_capacity(product_id, CapacityEdit::Delta(delta), reason, actor)
            .await
    }

    /// Set a product's capacity to an absolute value.
    ///
    /// Same audit trail and events as [`adjust_stock`](Self::adjust_stock).
    ///
    /// # Errors
    ///
    /// - [`AllocationError::ItemNotFound`] if the product does not exist
    /// - [`AllocationError::InvalidStockAdjustment`] if `total` is negative
    #[tracing::instrument(skip_all, fields(product_id = %product_id, total, actor))]
    pub async fn set_capacity(
        &self,
        product_id: ProductId,
        total: i64,
        reason: &str,
        actor: &str,
    ) -> Result<InventoryAdjustment, AllocationError> {
        self.edit_capacity(product_id, CapacityEdit::Absolute(total), reason, actor)
            .await
    }

    async fn edit_capacity(
        &self,
        product_id: ProductId,
        edit: CapacityEdit,
        reason: &str,
        actor: &str,
    ) -> Result<InventoryAdjustment, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let product = find_product(&mut uow, product_id).await?;
        let mut ledger =
            PolicyLedger::lock(&mut uow, &product, self.settings.location_id, now).await?;

        let before = ledger.capacity_total();
        let (delta, after) = match edit {
            CapacityEdit::Delta(delta) => (delta, before.checked_add(delta)),
            CapacityEdit::Absolute(total) => (total.saturating_sub(before), Some(total)),
        };
        let after = after.filter(|after| *after >= 0).ok_or_else(|| {
            warn!(before, delta, "Rejected adjustment below zero");
            AllocationError::InvalidStockAdjustment {
                product_id,
                before,
                delta,
                after: before.saturating_add(delta),
            }
        })?;

        let available_before = ledger.capacity_remaining(&mut uow, None).await?;
        ledger.set_capacity_total(&mut uow, after, now).await?;
        let available_after = ledger.capacity_remaining(&mut uow, None).await?;

        let adjustment = InventoryAdjustment {
            id: AdjustmentId::new(),
            product_id,
            target: ledger.adjustment_target(),
            before,
            after,
            delta: after - before,
            reason: reason.to_string(),
            actor: actor.to_string(),
            created_at: now,
        };
        uow.insert_adjustment(&adjustment).await?;

        let publisher = OutboxPublisher::new().with("actor", actor);
        publisher
            .publish(
                &mut uow,
                &InventoryEvent::StockAdjusted {
                    adjustment: adjustment.clone(),
                },
                now,
            )
            .await?;
        if available_after > available_before {
            publisher
                .publish(
                    &mut uow,
                    &InventoryEvent::StockAvailabilityIncreased {
                        product_id,
                        reason: AvailabilityReason::StockAdjusted,
                        increased_by: available_after - available_before,
                        order_id: None,
                    },
                    now,
                )
                .await?;
        }
        uow.commit().await?;

        metrics::counter!("allocation.adjust.total", "policy" => product.policy.as_str())
            .increment(1);
        info!(
            policy = %product.policy,
            before,
            after,
            reason,
            "Capacity adjusted"
        );
        Ok(adjustment)
    }

    async fn create_hold<U: UnitOfWork>(
        &self,
        uow: &mut U,
        ledger: &PolicyLedger,
        session_id: &SessionId,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, AllocationError> {
        let product_id = ledger.product_id();
        let available = effective_stock_in(uow, ledger, None, now).await?;
        check_fits(quantity, available).map_err(|available| AllocationError::InsufficientStock {
            product_id,
            requested: quantity,
            available,
        })?;

        let reservation = StockReservation::tentative(
            product_id,
            session_id.clone(),
            quantity,
            now,
            now + self.settings.reservation_ttl,
        );
        uow.insert_reservation(&reservation).await?;
        let effective_stock = effective_stock_in(uow, ledger, None, now).await?;

        Ok(ReservationOutcome {
            reservation,
            effective_stock,
        })
    }

    async fn resize<U: UnitOfWork>(
        &self,
        uow: &mut U,
        ledger: &PolicyLedger,
        mut reservation: StockReservation,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, AllocationError> {
        let increase = quantity - reservation.quantity;
        if increase > 0 {
            let available = effective_stock_in(uow, ledger, None, now).await?;
            check_fits(increase, available).map_err(|available| {
                AllocationError::InsufficientStock {
                    product_id: reservation.product_id,
                    requested: increase,
                    available,
                }
            })?;
        }

        reservation.quantity = quantity;
        reservation.expires_at = Some(now + self.settings.reservation_ttl);
        reservation.updated_at = now;
        uow.update_reservation(&reservation)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => AllocationError::ReservationNotFound {
                    session_id: reservation.session_id.clone(),
                    product_id: reservation.product_id,
                },
                other => other.into(),
            })?;
        let effective_stock = effective_stock_in(uow, ledger, None, now).await?;

        Ok(ReservationOutcome {
            reservation,
            effective_stock,
        })
    }
}

const fn ensure_positive(quantity: i64) -> Result<(), AllocationError> {
    if quantity > 0 {
        Ok(())
    } else {
        Err(AllocationError::InvalidQuantity(quantity))
    }
}

async fn find_product<U: UnitOfWork>(
    uow: &mut U,
    product_id: ProductId,
) -> Result<Product, AllocationError> {
    uow.find_product(product_id)
        .await?
        .ok_or(AllocationError::ItemNotFound(product_id))
}

fn shortage(product: &Product, requested: i64, available: i64) -> Shortage {
    Shortage {
        product_id: product.id,
        product_name: product.name.clone(),
        requested,
        available,
    }
}

fn record_outcome(
    operation: &'static str,
    outcome: Result<ReservationOutcome, AllocationError>,
) -> Result<ReservationOutcome, AllocationError> {
    let label = match &outcome {
        Ok(_) => "granted",
        Err(e) if e.is_capacity_conflict() => {
            warn!(error = %e, "Hold rejected");
            "insufficient_stock"
        },
        Err(_) => "error",
    };
    metrics::counter!("allocation.reserve.total", "operation" => operation, "outcome" => label)
        .increment(1);
    outcome
}
