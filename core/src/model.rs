//! Data model for the allocation engine.
//!
//! Two ledgers exist side by side and a product uses exactly one of them,
//! chosen by its [`AllocationPolicy`]:
//!
//! - [`LocationStock`] for REAL products: physical units per location with a
//!   cached `allocated_qty` counter updated on commit and cancellation.
//! - [`SalesLimit`] for FRAME products: a quota whose consumption is never
//!   stored, only derived from live order lines.

use crate::ids::{
    AdjustmentId, LocationId, OrderId, OrderItemId, ProductId, ReservationId, SessionId,
};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Products
// ============================================================================

/// Which ledger backs a product's capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationPolicy {
    /// Physical, admin-adjustable stock at a location.
    Real,
    /// Shared sales quota not tied to a location.
    Frame,
}

impl AllocationPolicy {
    /// Convert policy to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "REAL",
            Self::Frame => "FRAME",
        }
    }

    /// Parse policy from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known policy.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "REAL" => Ok(Self::Real),
            "FRAME" => Ok(Self::Frame),
            _ => Err(StoreError::Corrupt(format!("Invalid allocation policy: {s}"))),
        }
    }
}

impl fmt::Display for AllocationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of a catalog product the engine needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier
    pub id: ProductId,
    /// Display name, used in shortage reports
    pub name: String,
    /// Ledger policy (immutable per product)
    pub policy: AllocationPolicy,
}

impl Product {
    /// Creates a new product reference.
    #[must_use]
    pub fn new(id: ProductId, name: impl Into<String>, policy: AllocationPolicy) -> Self {
        Self {
            id,
            name: name.into(),
            policy,
        }
    }
}

// ============================================================================
// Ledgers
// ============================================================================

/// REAL-policy ledger row, one per product and location.
///
/// `allocated_qty` may exceed `allocatable_qty` after an admin lowers stock below
/// what is already committed; [`remaining`](Self::remaining) floors at zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStock {
    /// Product this row belongs to
    pub product_id: ProductId,
    /// Location this row belongs to
    pub location_id: LocationId,
    /// Physical units available to allocate (admin-controlled)
    pub allocatable_qty: i64,
    /// Units committed to live orders
    pub allocated_qty: i64,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl LocationStock {
    /// A freshly created row with both counters at zero.
    #[must_use]
    pub const fn empty(product_id: ProductId, location_id: LocationId, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            location_id,
            allocatable_qty: 0,
            allocated_qty: 0,
            updated_at: now,
        }
    }

    /// Units not yet committed to an order, never negative.
    #[must_use]
    pub fn remaining(&self) -> i64 {
        (self.allocatable_qty - self.allocated_qty).max(0)
    }
}

/// FRAME-policy ledger row, one per product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesLimit {
    /// Product this quota belongs to
    pub product_id: ProductId,
    /// Total quantity sellable across all orders
    pub sales_limit_total: i64,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl SalesLimit {
    /// A freshly created quota of zero.
    #[must_use]
    pub const fn empty(product_id: ProductId, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            sales_limit_total: 0,
            updated_at: now,
        }
    }

    /// Quota left after `consumed` units, never negative.
    #[must_use]
    pub fn headroom(&self, consumed: i64) -> i64 {
        (self.sales_limit_total - consumed).max(0)
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Lifecycle stage of a reservation row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationKind {
    /// Time-bounded cart hold
    Tentative,
    /// Pivot row bound to an order while a commit is in flight
    Committed,
}

impl ReservationKind {
    /// Convert kind to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tentative => "TENTATIVE",
            Self::Committed => "COMMITTED",
        }
    }

    /// Parse kind from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known kind.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "TENTATIVE" => Ok(Self::Tentative),
            "COMMITTED" => Ok(Self::Committed),
            _ => Err(StoreError::Corrupt(format!("Invalid reservation kind: {s}"))),
        }
    }
}

/// A hold on stock by a shopper session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    /// Reservation identifier
    pub id: ReservationId,
    /// Product held
    pub product_id: ProductId,
    /// Owning session
    pub session_id: SessionId,
    /// Units held
    pub quantity: i64,
    /// Tentative or committed
    pub kind: ReservationKind,
    /// Order the hold was committed to (committed rows only)
    pub order_id: Option<OrderId>,
    /// Expiry (tentative rows only)
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl StockReservation {
    /// New tentative hold expiring at `expires_at`.
    #[must_use]
    pub fn tentative(
        product_id: ProductId,
        session_id: SessionId,
        quantity: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            product_id,
            session_id,
            quantity,
            kind: ReservationKind::Tentative,
            order_id: None,
            expires_at: Some(expires_at),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this row still counts against effective stock at `now`.
    ///
    /// A tentative row past its expiry counts as gone even before the sweep
    /// physically deletes it.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.kind == ReservationKind::Tentative && self.expires_at.is_some_and(|at| at > now)
    }

    /// Turn this hold into the commit pivot for `order_id`.
    pub fn commit_to(&mut self, order_id: OrderId, now: DateTime<Utc>) {
        self.kind = ReservationKind::Committed;
        self.order_id = Some(order_id);
        self.expires_at = None;
        self.updated_at = now;
    }
}

// ============================================================================
// Orders (owned externally)
// ============================================================================

/// Order lifecycle state as seen by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Placed, awaiting confirmation
    Pending,
    /// Confirmed by the shop
    Confirmed,
    /// Being picked and packed
    Preparing,
    /// Handed to the carrier
    Shipped,
    /// Received by the customer
    Delivered,
    /// Cancelled; its lines no longer consume capacity
    Cancelled,
}

impl OrderStatus {
    /// Shipped and delivered orders can no longer release their stock.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Shipped | Self::Delivered)
    }

    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Preparing => "PREPARING",
            Self::Shipped => "SHIPPED",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "PREPARING" => Ok(Self::Preparing),
            "SHIPPED" => Ok(Self::Shipped),
            "DELIVERED" => Ok(Self::Delivered),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(StoreError::Corrupt(format!("Invalid order status: {s}"))),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order.
///
/// `fulfilled_quantity` is the single allocation-progress field: set during
/// commit for REAL lines, materialised by the FRAME retry service for FRAME lines.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Line identifier
    pub id: OrderItemId,
    /// Owning order
    pub order_id: OrderId,
    /// Ordered product
    pub product_id: ProductId,
    /// Ordered quantity
    pub quantity: i64,
    /// How much of `quantity` is backed by the ledger
    pub fulfilled_quantity: i64,
}

impl OrderItem {
    /// New line with nothing fulfilled yet.
    #[must_use]
    pub fn new(order_id: OrderId, product_id: ProductId, quantity: i64) -> Self {
        Self {
            id: OrderItemId::new(),
            order_id,
            product_id,
            quantity,
            fulfilled_quantity: 0,
        }
    }

    /// Units still waiting for capacity.
    #[must_use]
    pub fn pending(&self) -> i64 {
        (self.quantity - self.fulfilled_quantity).max(0)
    }
}

/// An order together with its lines.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Lifecycle state
    pub status: OrderStatus,
    /// Placement time, the FIFO key for FRAME fairness
    pub placed_at: DateTime<Utc>,
    /// Order lines
    pub items: Vec<OrderItem>,
}

impl Order {
    /// The line ordering `product_id`, if any.
    #[must_use]
    pub fn item_for(&self, product_id: ProductId) -> Option<&OrderItem> {
        self.items.iter().find(|item| item.product_id == product_id)
    }

    /// Whether every line is fully backed by the ledger.
    #[must_use]
    pub fn is_fully_fulfilled(&self) -> bool {
        self.items.iter().all(|item| item.pending() == 0)
    }
}

/// A FRAME order line as seen by the fairness rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameClaim {
    /// Owning order
    pub order_id: OrderId,
    /// Order placement time
    pub placed_at: DateTime<Utc>,
    /// Ordered quantity
    pub quantity: i64,
    /// Materialised fulfilment
    pub fulfilled_quantity: i64,
}

/// A REAL ledger row next to the order-derived truth it caches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerAuditRow {
    /// Product
    pub product_id: ProductId,
    /// Location
    pub location_id: LocationId,
    /// Cached counter on the ledger row
    pub allocated_qty: i64,
    /// Σ fulfilled quantity over non-cancelled order lines
    pub order_fulfilled_qty: i64,
}

// ============================================================================
// Audit
// ============================================================================

/// Which ledger field an adjustment edited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustmentTarget {
    /// `LocationStock.allocatable_qty`
    AllocatableQuantity,
    /// `SalesLimit.sales_limit_total`
    SalesLimitTotal,
}

impl AdjustmentTarget {
    /// Convert target to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AllocatableQuantity => "ALLOCATABLE_QTY",
            Self::SalesLimitTotal => "SALES_LIMIT_TOTAL",
        }
    }

    /// Parse target from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known target.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "ALLOCATABLE_QTY" => Ok(Self::AllocatableQuantity),
            "SALES_LIMIT_TOTAL" => Ok(Self::SalesLimitTotal),
            _ => Err(StoreError::Corrupt(format!("Invalid adjustment target: {s}"))),
        }
    }
}

/// Immutable record of an admin-driven ledger edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustment {
    /// Audit row identifier
    pub id: AdjustmentId,
    /// Product edited
    pub product_id: ProductId,
    /// Field edited
    pub target: AdjustmentTarget,
    /// Value before the edit
    pub before: i64,
    /// Value after the edit
    pub after: i64,
    /// `after - before`
    pub delta: i64,
    /// Free-form reason supplied by the operator
    pub reason: String,
    /// Who made the edit
    pub actor: String,
    /// When the edit was made
    pub created_at: DateTime<Utc>,
}
