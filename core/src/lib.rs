//! # Allotment Core
//!
//! Domain model and storage seam for the Allotment inventory reservation and
//! allocation engine.
//!
//! This crate provides the pieces every other crate in the workspace agrees on:
//!
//! - **Identifiers**: strongly typed ids for products, orders, sessions and ledger rows
//! - **Model**: the ledger rows (`LocationStock`, `SalesLimit`), reservations, orders and
//!   the immutable adjustment audit record
//! - **Capacity**: the pure arithmetic behind available-to-promise and FRAME fairness
//! - **Errors**: the stable, machine-readable error taxonomy surfaced to callers
//! - **Outbox**: events written in the same unit of work as the state they describe
//! - **Store**: the `AllocationStore` / `UnitOfWork` traits implemented by the Postgres
//!   adapter and the in-memory test double
//!
//! ## Allocation policies
//!
//! ```text
//! REAL   capacity = allocatable_qty - allocated_qty          (cached counter, audited)
//! FRAME  capacity = sales_limit_total - Σ ordered quantity   (derived from live orders)
//!
//! effective stock = max(0, capacity - Σ active tentative holds)
//! ```
//!
//! ## Example
//!
//! ```
//! use allotment_core::capacity::effective_stock;
//! use allotment_core::model::LocationStock;
//! use allotment_core::ids::{LocationId, ProductId};
//! use chrono::Utc;
//!
//! let mut row = LocationStock::empty(ProductId::new(), LocationId::DEFAULT, Utc::now());
//! row.allocatable_qty = 10;
//! row.allocated_qty = 6;
//!
//! // 4 physical units left, 3 of them held by shopper carts.
//! assert_eq!(effective_stock(row.remaining(), 3), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capacity;
pub mod error;
pub mod event;
pub mod ids;
pub mod model;
pub mod outbox;
pub mod store;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{AllocationError, ErrorBody, Shortage};
pub use event::{AvailabilityReason, InventoryEvent};
pub use ids::{
    AdjustmentId, LocationId, OrderId, OrderItemId, ProductId, ReservationId, SessionId,
};
pub use model::{AllocationPolicy, Order, OrderItem, OrderStatus, Product, StockReservation};
pub use store::{AllocationStore, Isolation, StoreError, UnitOfWork};

/// Environment module - time as an injected dependency.
///
/// All engine operations that compare against "now" (reservation expiry, audit
/// timestamps) read it from a [`Clock`](environment::Clock) so tests can pin or
/// advance time deterministically.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use allotment_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
