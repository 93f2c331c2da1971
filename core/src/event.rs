//! Events written to the outbox.
//!
//! Every event describes a state change that downstream systems care about and
//! is appended in the same unit of work as that change. Payloads are `bincode`
//! encoded; the type name carries a version suffix so consumers can evolve.
//!
//! # Example
//!
//! ```
//! use allotment_core::event::{AvailabilityReason, InventoryEvent, OutboxEvent};
//! use allotment_core::ids::ProductId;
//!
//! let event = InventoryEvent::StockAvailabilityIncreased {
//!     product_id: ProductId::new(),
//!     reason: AvailabilityReason::StockAdjusted,
//!     increased_by: 5,
//!     order_id: None,
//! };
//!
//! assert_eq!(event.event_type(), "StockAvailabilityIncreased.v1");
//! let bytes = event.encode().unwrap();
//! assert_eq!(InventoryEvent::decode(&bytes).unwrap(), event);
//! ```

use crate::ids::{OrderId, ProductId, SessionId};
use crate::model::{AllocationPolicy, InventoryAdjustment};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Failure to encode or decode an outbox payload.
#[derive(Error, Debug)]
pub enum EventSerializationError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    Serialize(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    Deserialize(String),
}

/// An event that can be recorded in the outbox.
pub trait OutboxEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Versioned type identifier, e.g. `"OrderCancelled.v1"`.
    fn event_type(&self) -> &'static str;

    /// Aggregate the event belongs to: `(aggregate_type, aggregate_id)`.
    fn aggregate(&self) -> (&'static str, String);

    /// Encode the payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventSerializationError::Serialize`] if encoding fails.
    fn encode(&self) -> Result<Vec<u8>, EventSerializationError> {
        bincode::serialize(self).map_err(|e| EventSerializationError::Serialize(e.to_string()))
    }

    /// Decode a payload written by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`EventSerializationError::Deserialize`] if the bytes are not a
    /// valid payload of this type.
    fn decode(bytes: &[u8]) -> Result<Self, EventSerializationError>
    where
        Self: Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventSerializationError::Deserialize(e.to_string()))
    }
}

/// Why available capacity went up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityReason {
    /// An order released its committed stock
    OrderCancelled,
    /// An administrator raised stock or a sales limit
    StockAdjusted,
}

/// A line applied by a successful commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedLine {
    /// Product
    pub product_id: ProductId,
    /// Ledger policy of the product
    pub policy: AllocationPolicy,
    /// Units taken from the reservation
    pub quantity: i64,
    /// Fulfilled quantity written to the order line
    pub fulfilled_quantity: i64,
}

/// A line released by an order cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedLine {
    /// Product
    pub product_id: ProductId,
    /// Ledger policy of the product
    pub policy: AllocationPolicy,
    /// Fulfilled quantity that was zeroed
    pub freed: i64,
    /// Capacity that became available again
    pub availability_increase: i64,
}

/// Outbox events produced by the allocation engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    /// Capacity for a product grew.
    StockAvailabilityIncreased {
        /// Product whose capacity grew
        product_id: ProductId,
        /// What caused it
        reason: AvailabilityReason,
        /// By how many units
        increased_by: i64,
        /// Triggering order, for cancellations
        order_id: Option<OrderId>,
    },

    /// A session's holds were committed to an order.
    OrderStockCommitted {
        /// Order
        order_id: OrderId,
        /// Session whose holds were consumed
        session_id: SessionId,
        /// Applied lines
        lines: Vec<CommittedLine>,
    },

    /// An order was cancelled and its stock released.
    OrderCancelled {
        /// Order
        order_id: OrderId,
        /// Released lines
        released: Vec<ReleasedLine>,
    },

    /// An administrator edited a ledger value.
    StockAdjusted {
        /// The audit row written for the edit
        adjustment: InventoryAdjustment,
    },

    /// The FRAME retry service materialised more of a line.
    FrameAllocationProgressed {
        /// Order
        order_id: OrderId,
        /// Product
        product_id: ProductId,
        /// Fulfilled quantity after this run
        fulfilled: i64,
        /// Quantity still pending
        remaining: i64,
    },
}

impl OutboxEvent for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::StockAvailabilityIncreased { .. } => "StockAvailabilityIncreased.v1",
            Self::OrderStockCommitted { .. } => "OrderStockCommitted.v1",
            Self::OrderCancelled { .. } => "OrderCancelled.v1",
            Self::StockAdjusted { .. } => "StockAdjusted.v1",
            Self::FrameAllocationProgressed { .. } => "FrameAllocationProgressed.v1",
        }
    }

    fn aggregate(&self) -> (&'static str, String) {
        match self {
            Self::StockAvailabilityIncreased { product_id, .. }
            | Self::FrameAllocationProgressed { product_id, .. } => {
                ("product", product_id.to_string())
            },
            Self::StockAdjusted { adjustment } => ("product", adjustment.product_id.to_string()),
            Self::OrderStockCommitted { order_id, .. } | Self::OrderCancelled { order_id, .. } => {
                ("order", order_id.to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_follow_the_subject() {
        let order_id = OrderId::new();
        let event = InventoryEvent::OrderCancelled {
            order_id,
            released: vec![],
        };
        assert_eq!(event.aggregate(), ("order", order_id.to_string()));

        let product_id = ProductId::new();
        let event = InventoryEvent::FrameAllocationProgressed {
            order_id,
            product_id,
            fulfilled: 2,
            remaining: 1,
        };
        assert_eq!(event.aggregate(), ("product", product_id.to_string()));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn commit_event_survives_encoding() {
        let event = InventoryEvent::OrderStockCommitted {
            order_id: OrderId::new(),
            session_id: SessionId::from("cart-9"),
            lines: vec![CommittedLine {
                product_id: ProductId::new(),
                policy: AllocationPolicy::Real,
                quantity: 3,
                fulfilled_quantity: 3,
            }],
        };

        let bytes = event.encode().expect("encoding should succeed");
        let decoded = InventoryEvent::decode(&bytes).expect("decoding should succeed");
        assert_eq!(decoded, event);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(InventoryEvent::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
