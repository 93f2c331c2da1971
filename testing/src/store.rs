//! In-memory implementation of the storage seam.
//!
//! A unit of work holds the store-wide lock for its whole lifetime and edits a
//! private copy of the state. [`UnitOfWork::commit`] swaps the copy in;
//! dropping the unit of work discards it. This gives the same observable
//! contract as a Postgres transaction with exclusive row locks (atomic writes,
//! rollback on every early return) at the cost of serializing all units of
//! work, which is what deterministic tests want anyway.
//!
//! Isolation levels are accepted and ignored: a fully serialized store
//! satisfies both.

use allotment_core::ids::{LocationId, OrderId, OrderItemId, ProductId, ReservationId, SessionId};
use allotment_core::model::{
    AllocationPolicy, FrameClaim, InventoryAdjustment, LedgerAuditRow, LocationStock, Order,
    OrderStatus, Product, ReservationKind, SalesLimit, StockReservation,
};
use allotment_core::outbox::{OutboxMessage, OutboxRecord};
use allotment_core::store::{AllocationStore, Isolation, StoreError, UnitOfWork};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
struct StoreState {
    products: HashMap<ProductId, Product>,
    orders: HashMap<OrderId, Order>,
    location_stocks: HashMap<(ProductId, LocationId), LocationStock>,
    sales_limits: HashMap<ProductId, SalesLimit>,
    reservations: HashMap<ReservationId, StockReservation>,
    adjustments: Vec<InventoryAdjustment>,
    outbox: Vec<OutboxRecord>,
    next_sequence: i64,
}

impl StoreState {
    fn policy_of(&self, product_id: ProductId) -> Option<AllocationPolicy> {
        self.products.get(&product_id).map(|p| p.policy)
    }

    fn live_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders
            .values()
            .filter(|order| order.status != OrderStatus::Cancelled)
    }
}

/// In-memory allocation store for tests.
///
/// Cloning is cheap and every clone sees the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAllocationStore {
    state: Arc<Mutex<StoreState>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryAllocationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`UnitOfWork::commit`] fail with a database error.
    ///
    /// The unit of work is rolled back, exactly as a failed Postgres commit.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Register a product.
    pub async fn add_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    /// Register an order with its lines.
    pub async fn add_order(&self, order: Order) {
        self.state.lock().await.orders.insert(order.id, order);
    }

    /// Set `allocatable_qty` at the default location, creating the row.
    pub async fn set_allocatable(&self, product_id: ProductId, allocatable_qty: i64) {
        self.set_location_stock(product_id, allocatable_qty, 0).await;
    }

    /// Set both counters at the default location, creating the row.
    pub async fn set_location_stock(
        &self,
        product_id: ProductId,
        allocatable_qty: i64,
        allocated_qty: i64,
    ) {
        let mut state = self.state.lock().await;
        let row = state
            .location_stocks
            .entry((product_id, LocationId::DEFAULT))
            .or_insert_with(|| LocationStock::empty(product_id, LocationId::DEFAULT, Utc::now()));
        row.allocatable_qty = allocatable_qty;
        row.allocated_qty = allocated_qty;
    }

    /// Set a FRAME sales limit, creating the row.
    pub async fn set_sales_limit(&self, product_id: ProductId, sales_limit_total: i64) {
        let mut state = self.state.lock().await;
        let row = state
            .sales_limits
            .entry(product_id)
            .or_insert_with(|| SalesLimit::empty(product_id, Utc::now()));
        row.sales_limit_total = sales_limit_total;
    }

    /// Insert a reservation row as-is (e.g. one that has already expired).
    pub async fn put_reservation(&self, reservation: StockReservation) {
        self.state
            .lock()
            .await
            .reservations
            .insert(reservation.id, reservation);
    }

    /// Change an order's status outside the engine (order lifecycle).
    pub async fn set_order_status(&self, order_id: OrderId, status: OrderStatus) {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            order.status = status;
        }
    }

    /// Overwrite `allocated_qty` to simulate ledger drift.
    pub async fn corrupt_allocated(&self, product_id: ProductId, allocated_qty: i64) {
        if let Some(row) = self
            .state
            .lock()
            .await
            .location_stocks
            .get_mut(&(product_id, LocationId::DEFAULT))
        {
            row.allocated_qty = allocated_qty;
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// The REAL ledger row at the default location.
    pub async fn location_stock(&self, product_id: ProductId) -> Option<LocationStock> {
        self.state
            .lock()
            .await
            .location_stocks
            .get(&(product_id, LocationId::DEFAULT))
            .cloned()
    }

    /// The FRAME ledger row.
    pub async fn sales_limit(&self, product_id: ProductId) -> Option<SalesLimit> {
        self.state.lock().await.sales_limits.get(&product_id).cloned()
    }

    /// An order with its lines.
    pub async fn order(&self, order_id: OrderId) -> Option<Order> {
        self.state.lock().await.orders.get(&order_id).cloned()
    }

    /// Every reservation row, expired or not.
    pub async fn reservations(&self) -> Vec<StockReservation> {
        let mut rows: Vec<_> = self
            .state
            .lock()
            .await
            .reservations
            .values()
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows
    }

    /// Every adjustment audit row in write order.
    pub async fn adjustments(&self) -> Vec<InventoryAdjustment> {
        self.state.lock().await.adjustments.clone()
    }

    /// Every outbox row in write order.
    pub async fn outbox(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.outbox.clone()
    }
}

impl AllocationStore for InMemoryAllocationStore {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn begin(&self, _isolation: Isolation) -> Result<InMemoryUnitOfWork, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryUnitOfWork {
            guard,
            working,
            fail_commit: Arc::clone(&self.fail_next_commit),
        })
    }
}

/// A unit of work over [`InMemoryAllocationStore`].
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
    fail_commit: Arc<AtomicBool>,
}

impl UnitOfWork for InMemoryUnitOfWork {
    async fn find_product(&mut self, product_id: ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.working.products.get(&product_id).cloned())
    }

    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.working.orders.get(&order_id).cloned())
    }

    async fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        let order = self
            .working
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::Database(format!("order {order_id} does not exist")))?;
        order.status = status;
        Ok(())
    }

    async fn set_fulfilled_quantity(
        &mut self,
        item_id: OrderItemId,
        fulfilled_quantity: i64,
    ) -> Result<(), StoreError> {
        let item = self
            .working
            .orders
            .values_mut()
            .flat_map(|order| order.items.iter_mut())
            .find(|item| item.id == item_id)
            .ok_or_else(|| StoreError::Database(format!("order item {item_id} does not exist")))?;
        item.fulfilled_quantity = fulfilled_quantity;
        Ok(())
    }

    async fn orders_with_pending_frame_lines(&mut self) -> Result<Vec<OrderId>, StoreError> {
        let state = &self.working;
        let mut pending: Vec<(DateTime<Utc>, OrderId)> = state
            .live_orders()
            .filter(|order| {
                order.items.iter().any(|item| {
                    state.policy_of(item.product_id) == Some(AllocationPolicy::Frame)
                        && item.pending() > 0
                })
            })
            .map(|order| (order.placed_at, order.id))
            .collect();
        pending.sort();
        Ok(pending.into_iter().map(|(_, id)| id).collect())
    }

    async fn lock_location_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> Result<LocationStock, StoreError> {
        Ok(self
            .working
            .location_stocks
            .entry((product_id, location_id))
            .or_insert_with(|| LocationStock::empty(product_id, location_id, now))
            .clone())
    }

    async fn lock_sales_limit(
        &mut self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<SalesLimit, StoreError> {
        Ok(self
            .working
            .sales_limits
            .entry(product_id)
            .or_insert_with(|| SalesLimit::empty(product_id, now))
            .clone())
    }

    async fn find_location_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> Result<Option<LocationStock>, StoreError> {
        Ok(self
            .working
            .location_stocks
            .get(&(product_id, location_id))
            .cloned())
    }

    async fn find_sales_limit(
        &mut self,
        product_id: ProductId,
    ) -> Result<Option<SalesLimit>, StoreError> {
        Ok(self.working.sales_limits.get(&product_id).cloned())
    }

    async fn save_location_stock(&mut self, row: &LocationStock) -> Result<(), StoreError> {
        self.working
            .location_stocks
            .insert((row.product_id, row.location_id), row.clone());
        Ok(())
    }

    async fn save_sales_limit(&mut self, row: &SalesLimit) -> Result<(), StoreError> {
        self.working.sales_limits.insert(row.product_id, row.clone());
        Ok(())
    }

    async fn frame_consumed(
        &mut self,
        product_id: ProductId,
        exclude_order: Option<OrderId>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .working
            .live_orders()
            .filter(|order| Some(order.id) != exclude_order)
            .flat_map(|order| order.items.iter())
            .filter(|item| item.product_id == product_id)
            .map(|item| item.quantity)
            .sum())
    }

    async fn frame_claims(&mut self, product_id: ProductId) -> Result<Vec<FrameClaim>, StoreError> {
        let mut claims: Vec<FrameClaim> = self
            .working
            .live_orders()
            .flat_map(|order| {
                order
                    .items
                    .iter()
                    .filter(move |item| item.product_id == product_id)
                    .map(move |item| FrameClaim {
                        order_id: order.id,
                        placed_at: order.placed_at,
                        quantity: item.quantity,
                        fulfilled_quantity: item.fulfilled_quantity,
                    })
            })
            .collect();
        claims.sort_by_key(|c| (c.placed_at, c.order_id));
        Ok(claims)
    }

    async fn real_ledger_audit_rows(&mut self) -> Result<Vec<LedgerAuditRow>, StoreError> {
        let state = &self.working;
        let mut rows: Vec<LedgerAuditRow> = state
            .location_stocks
            .values()
            .filter(|row| state.policy_of(row.product_id) == Some(AllocationPolicy::Real))
            .map(|row| LedgerAuditRow {
                product_id: row.product_id,
                location_id: row.location_id,
                allocated_qty: row.allocated_qty,
                order_fulfilled_qty: state
                    .live_orders()
                    .flat_map(|order| order.items.iter())
                    .filter(|item| item.product_id == row.product_id)
                    .map(|item| item.fulfilled_quantity)
                    .sum(),
            })
            .collect();
        rows.sort_by_key(|r| (r.product_id, r.location_id));
        Ok(rows)
    }

    async fn active_tentative(
        &mut self,
        session_id: &SessionId,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<Option<StockReservation>, StoreError> {
        Ok(self
            .working
            .reservations
            .values()
            .find(|r| {
                &r.session_id == session_id && r.product_id == product_id && r.is_active_at(now)
            })
            .cloned())
    }

    async fn active_tentatives_for_session(
        &mut self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let mut rows: Vec<StockReservation> = self
            .working
            .reservations
            .values()
            .filter(|r| &r.session_id == session_id && r.is_active_at(now))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.product_id);
        Ok(rows)
    }

    async fn active_tentative_total(
        &mut self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .working
            .reservations
            .values()
            .filter(|r| r.product_id == product_id && r.is_active_at(now))
            .map(|r| r.quantity)
            .sum())
    }

    async fn insert_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError> {
        if self.working.reservations.contains_key(&reservation.id) {
            return Err(StoreError::Database(format!(
                "duplicate reservation id {}",
                reservation.id
            )));
        }
        self.working
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError> {
        let row = self
            .working
            .reservations
            .get_mut(&reservation.id)
            .ok_or_else(|| {
                StoreError::NotFound(format!("reservation {} does not exist", reservation.id))
            })?;
        *row = reservation.clone();
        Ok(())
    }

    async fn delete_reservation(&mut self, reservation_id: ReservationId) -> Result<bool, StoreError> {
        Ok(self.working.reservations.remove(&reservation_id).is_some())
    }

    async fn delete_tentatives_for_session(
        &mut self,
        session_id: &SessionId,
    ) -> Result<u64, StoreError> {
        Ok(retain_counting(&mut self.working.reservations, |r| {
            !(r.kind == ReservationKind::Tentative && &r.session_id == session_id)
        }))
    }

    async fn delete_committed_for_order(&mut self, order_id: OrderId) -> Result<u64, StoreError> {
        Ok(retain_counting(&mut self.working.reservations, |r| {
            !(r.kind == ReservationKind::Committed && r.order_id == Some(order_id))
        }))
    }

    async fn delete_expired_tentatives(&mut self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(retain_counting(&mut self.working.reservations, |r| {
            !(r.kind == ReservationKind::Tentative && r.expires_at.is_some_and(|at| at < now))
        }))
    }

    async fn insert_adjustment(&mut self, adjustment: &InventoryAdjustment) -> Result<(), StoreError> {
        self.working.adjustments.push(adjustment.clone());
        Ok(())
    }

    async fn append_outbox(&mut self, message: &OutboxMessage) -> Result<i64, StoreError> {
        self.working.next_sequence += 1;
        let sequence = self.working.next_sequence;
        self.working.outbox.push(OutboxRecord {
            sequence,
            message: message.clone(),
        });
        Ok(sequence)
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("injected commit failure".to_string()));
        }
        let Self {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }
}

fn retain_counting(
    reservations: &mut HashMap<ReservationId, StockReservation>,
    keep: impl Fn(&StockReservation) -> bool,
) -> u64 {
    let before = reservations.len();
    reservations.retain(|_, r| keep(r));
    u64::try_from(before - reservations.len()).unwrap_or(u64::MAX)
}
