//! Error taxonomy for the allocation engine.
//!
//! Every failure carries a stable machine-readable code (see
//! [`AllocationError::code`]) and a human-readable message. Capacity failures
//! also carry per-line detail so a caller can tell the shopper exactly which
//! item fell short.

use crate::event::EventSerializationError;
use crate::ids::{OrderId, ProductId, SessionId};
use crate::model::OrderStatus;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One order line that could not be satisfied at commit time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortage {
    /// Product that fell short
    pub product_id: ProductId,
    /// Product display name
    pub product_name: String,
    /// Quantity the reservation asked for
    pub requested: i64,
    /// Quantity the ledger could still provide
    pub available: i64,
}

/// Errors surfaced by allocation engine operations.
#[derive(Error, Debug)]
pub enum AllocationError {
    /// Product (or the order line for it) does not exist.
    #[error("Item not found: {0}")]
    ItemNotFound(ProductId),

    /// No active tentative reservation for the session and product.
    #[error("No active reservation for product {product_id} in session {session_id}")]
    ReservationNotFound {
        /// Session that was searched
        session_id: SessionId,
        /// Product that was searched
        product_id: ProductId,
    },

    /// Order does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// A single hold does not fit into the remaining effective stock.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product that was requested
        product_id: ProductId,
        /// Quantity (or delta) that was requested
        requested: i64,
        /// Effective stock at the time of the check
        available: i64,
    },

    /// One or more lines of a commit do not fit; nothing was applied.
    #[error("Out of stock: {} line(s) cannot be fulfilled", shortages.len())]
    OutOfStock {
        /// Every failing line, not just the first
        shortages: Vec<Shortage>,
    },

    /// Commit was called for a session without active holds.
    #[error("Session {0} holds no active reservations")]
    NoReservations(SessionId),

    /// Order was cancelled before.
    #[error("Order {0} is already cancelled")]
    AlreadyCancelled(OrderId),

    /// Order is in a terminal state and cannot release its stock.
    #[error("Order {order_id} is {status} and can no longer be cancelled")]
    OrderNotCancellable {
        /// Order that was asked to cancel
        order_id: OrderId,
        /// Its current status
        status: OrderStatus,
    },

    /// Admin edit would drive a ledger value below zero.
    #[error("Adjusting product {product_id} by {delta} would move it from {before} to {after}")]
    InvalidStockAdjustment {
        /// Product being edited
        product_id: ProductId,
        /// Value before the edit
        before: i64,
        /// Requested change
        delta: i64,
        /// Resulting (rejected) value
        after: i64,
    },

    /// Reservation quantities must be positive.
    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    /// Storage failure; the unit of work was rolled back.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Outbox payload could not be encoded; the unit of work was rolled back.
    #[error(transparent)]
    Event(#[from] EventSerializationError),
}

impl AllocationError {
    /// Stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ItemNotFound(_) => "ITEM_NOT_FOUND",
            Self::ReservationNotFound { .. } => "RESERVATION_NOT_FOUND",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::OutOfStock { .. } => "OUT_OF_STOCK",
            Self::NoReservations(_) => "NO_RESERVATIONS",
            Self::AlreadyCancelled(_) => "ALREADY_CANCELLED",
            Self::OrderNotCancellable { .. } => "ORDER_NOT_CANCELLABLE",
            Self::InvalidStockAdjustment { .. } => "INVALID_STOCK_ADJUSTMENT",
            Self::InvalidQuantity(_) => "INVALID_QUANTITY",
            Self::Store(_) | Self::Event(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller can recover by changing the request or waiting.
    #[must_use]
    pub const fn is_capacity_conflict(&self) -> bool {
        matches!(self, Self::InsufficientStock { .. } | Self::OutOfStock { .. })
    }

    /// Render the error for an API response.
    ///
    /// Internal failures get a generic message; their detail belongs in logs.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            Self::Store(_) | Self::Event(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };
        let shortages = match self {
            Self::OutOfStock { shortages } => shortages.clone(),
            Self::InsufficientStock {
                product_id,
                requested,
                available,
            } => vec![Shortage {
                product_id: *product_id,
                product_name: String::new(),
                requested: *requested,
                available: *available,
            }],
            _ => Vec::new(),
        };

        ErrorBody {
            code: self.code().to_string(),
            message,
            shortages,
        }
    }
}

/// Error response body (JSON) for the API layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Per-line capacity detail, empty for non-capacity errors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shortages: Vec<Shortage>,
}
