//! Product and order fixtures.

use allotment_core::ids::{OrderId, ProductId};
use allotment_core::model::{AllocationPolicy, Order, OrderItem, OrderStatus, Product};
use chrono::{DateTime, Utc};

/// A REAL-policy product with a fresh id.
#[must_use]
pub fn real_product(name: &str) -> Product {
    Product::new(ProductId::new(), name, AllocationPolicy::Real)
}

/// A FRAME-policy product with a fresh id.
#[must_use]
pub fn frame_product(name: &str) -> Product {
    Product::new(ProductId::new(), name, AllocationPolicy::Frame)
}

/// An order with one unfulfilled line per `(product, quantity)` pair.
#[must_use]
pub fn order(status: OrderStatus, placed_at: DateTime<Utc>, lines: &[(ProductId, i64)]) -> Order {
    let id = OrderId::new();
    Order {
        id,
        status,
        placed_at,
        items: lines
            .iter()
            .map(|(product_id, quantity)| OrderItem::new(id, *product_id, *quantity))
            .collect(),
    }
}

/// A freshly placed order awaiting commit.
#[must_use]
pub fn pending_order(placed_at: DateTime<Utc>, lines: &[(ProductId, i64)]) -> Order {
    order(OrderStatus::Pending, placed_at, lines)
}

/// A confirmed order whose lines are already fully fulfilled.
#[must_use]
pub fn fulfilled_order(placed_at: DateTime<Utc>, lines: &[(ProductId, i64)]) -> Order {
    let mut order = order(OrderStatus::Confirmed, placed_at, lines);
    for item in &mut order.items {
        item.fulfilled_quantity = item.quantity;
    }
    order
}
