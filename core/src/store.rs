//! Storage seam for the ledger, reservations and outbox.
//!
//! All engine operations run inside a [`UnitOfWork`] obtained from an
//! [`AllocationStore`]. A unit of work is a single atomic transaction:
//!
//! - Row locks taken through `lock_*` methods are held until the unit of work
//!   ends, whichever way it ends.
//! - Dropping a unit of work without calling [`UnitOfWork::commit`] rolls back
//!   every write made through it, outbox rows included.
//!
//! Locks are always acquired in the same order to avoid deadlocks: the order
//! row first (when the operation touches one), then ledger rows sorted by
//! product id.
//!
//! # Implementations
//!
//! - `PostgresAllocationStore` (in `allotment-postgres`): production storage
//! - `InMemoryAllocationStore` (in `allotment-testing`): deterministic test double

use crate::ids::{LocationId, OrderId, OrderItemId, ProductId, ReservationId, SessionId};
use crate::model::{
    FrameClaim, InventoryAdjustment, LedgerAuditRow, LocationStock, Order, OrderStatus, Product,
    SalesLimit, StockReservation,
};
use crate::outbox::OutboxMessage;
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

/// Errors raised by storage adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error (connection, query, constraint).
    #[error("Database error: {0}")]
    Database(String),

    /// A row lock could not be acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The database aborted the transaction to resolve a conflict.
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// A stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored value has no counterpart in the domain model.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// A row the caller read earlier was gone when it was written back.
    #[error("Row not found: {0}")]
    NotFound(String),
}

/// Transaction isolation for a unit of work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Isolation {
    /// Each statement sees rows committed before it started. Combined with
    /// exclusive row locks this is what write paths use: a read that follows
    /// a lock wait observes the winner's writes.
    #[default]
    ReadCommitted,
    /// Every statement sees the snapshot taken at the first read. Used for
    /// multi-query read-only reports.
    RepeatableRead,
}

impl Isolation {
    /// SQL name of the isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
        }
    }
}

/// Factory for units of work.
pub trait AllocationStore: Send + Sync {
    /// The transaction type handed out by [`begin`](Self::begin).
    type UnitOfWork: UnitOfWork;

    /// Start a new unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if no connection is available or the
    /// transaction cannot be opened.
    fn begin(
        &self,
        isolation: Isolation,
    ) -> impl Future<Output = Result<Self::UnitOfWork, StoreError>> + Send;
}

/// One atomic transaction over the allocation tables.
///
/// Every method returns [`StoreError`] on storage failure; callers propagate
/// it and drop the unit of work, which rolls it back.
pub trait UnitOfWork: Send {
    // ------------------------------------------------------------------
    // Products and orders
    // ------------------------------------------------------------------

    /// Look up a product.
    fn find_product(
        &mut self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<Product>, StoreError>> + Send;

    /// Lock an order row and load its lines.
    fn lock_order(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// Move an order to `status`.
    fn set_order_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Overwrite the fulfilled quantity of one order line.
    fn set_fulfilled_quantity(
        &mut self,
        item_id: OrderItemId,
        fulfilled_quantity: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Non-cancelled orders with at least one under-fulfilled FRAME line,
    /// oldest first by placement time, then id.
    fn orders_with_pending_frame_lines(
        &mut self,
    ) -> impl Future<Output = Result<Vec<OrderId>, StoreError>> + Send;

    // ------------------------------------------------------------------
    // Ledgers
    // ------------------------------------------------------------------

    /// Lock the REAL ledger row, creating it with zero counters if missing.
    fn lock_location_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<LocationStock, StoreError>> + Send;

    /// Lock the FRAME ledger row, creating it with a zero quota if missing.
    fn lock_sales_limit(
        &mut self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<SalesLimit, StoreError>> + Send;

    /// Read a REAL ledger row without locking it.
    fn find_location_stock(
        &mut self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> impl Future<Output = Result<Option<LocationStock>, StoreError>> + Send;

    /// Read a FRAME ledger row without locking it.
    fn find_sales_limit(
        &mut self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Option<SalesLimit>, StoreError>> + Send;

    /// Write back a REAL ledger row.
    fn save_location_stock(
        &mut self,
        row: &LocationStock,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write back a FRAME ledger row.
    fn save_sales_limit(
        &mut self,
        row: &SalesLimit,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Σ ordered quantity of `product_id` over non-cancelled orders, optionally
    /// leaving one order out.
    fn frame_consumed(
        &mut self,
        product_id: ProductId,
        exclude_order: Option<OrderId>,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Every non-cancelled order line for `product_id`, with its order's
    /// placement time.
    fn frame_claims(
        &mut self,
        product_id: ProductId,
    ) -> impl Future<Output = Result<Vec<FrameClaim>, StoreError>> + Send;

    /// Every REAL ledger row next to the fulfilled sum derived from orders.
    fn real_ledger_audit_rows(
        &mut self,
    ) -> impl Future<Output = Result<Vec<LedgerAuditRow>, StoreError>> + Send;

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    /// The unexpired tentative hold of `session_id` on `product_id`.
    ///
    /// The returned row stays locked until the unit of work ends, so a
    /// concurrent expiry sweep waits and then re-checks `expires_at`.
    fn active_tentative(
        &mut self,
        session_id: &SessionId,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<StockReservation>, StoreError>> + Send;

    /// Every unexpired tentative hold of `session_id`, sorted by product id.
    fn active_tentatives_for_session(
        &mut self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<StockReservation>, StoreError>> + Send;

    /// Σ quantity of unexpired tentative holds on `product_id`.
    fn active_tentative_total(
        &mut self,
        product_id: ProductId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Insert a reservation row.
    fn insert_reservation(
        &mut self,
        reservation: &StockReservation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Overwrite a reservation row.
    ///
    /// Fails with [`StoreError::NotFound`] if the row was deleted meanwhile.
    fn update_reservation(
        &mut self,
        reservation: &StockReservation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete a reservation row; `false` if it was already gone.
    fn delete_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Delete every tentative row of a session, expired or not.
    fn delete_tentatives_for_session(
        &mut self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Delete committed pivot rows bound to an order.
    fn delete_committed_for_order(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Delete tentative rows with `expires_at < now`.
    fn delete_expired_tentatives(
        &mut self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    // ------------------------------------------------------------------
    // Audit and outbox
    // ------------------------------------------------------------------

    /// Record an admin ledger edit.
    fn insert_adjustment(
        &mut self,
        adjustment: &InventoryAdjustment,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Append an outbox row, returning its sequence.
    fn append_outbox(
        &mut self,
        message: &OutboxMessage,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Make every write durable and release all locks.
    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
