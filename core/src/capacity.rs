//! Capacity arithmetic.
//!
//! Pure functions shared by the engine and both storage adapters. Nothing here
//! touches storage; callers pass in the ledger values they read under lock.

use crate::ids::OrderId;
use crate::model::FrameClaim;
use chrono::{DateTime, Utc};

/// Available-to-promise: capacity left after active cart holds, floored at zero.
#[must_use]
pub fn effective_stock(capacity: i64, held: i64) -> i64 {
    (capacity - held).max(0)
}

/// How much of a new or grown hold fits into the current headroom.
///
/// Returns `Err(available)` when `requested` exceeds it.
///
/// # Errors
///
/// Returns the available quantity when the request does not fit.
pub const fn check_fits(requested: i64, available: i64) -> Result<(), i64> {
    if requested > available {
        Err(available)
    } else {
        Ok(())
    }
}

/// FIFO headroom for one FRAME line of order `order_id` placed at `placed_at`.
///
/// Orders placed earlier keep a claim on their full ordered quantity; orders
/// placed later only hold what has already been materialised for them.
#[must_use]
pub fn frame_line_fit(
    limit: i64,
    claims: &[FrameClaim],
    order_id: OrderId,
    placed_at: DateTime<Utc>,
) -> i64 {
    let held: i64 = claims
        .iter()
        .filter(|claim| claim.order_id != order_id)
        .map(|claim| {
            if (claim.placed_at, claim.order_id) < (placed_at, order_id) {
                claim.quantity
            } else {
                claim.fulfilled_quantity
            }
        })
        .sum();
    (limit - held).max(0)
}

/// New fulfilled quantity for a FRAME line given its fit.
///
/// Never decreases and never exceeds the ordered quantity.
#[must_use]
pub fn frame_fulfilment(current: i64, quantity: i64, fit: i64) -> i64 {
    current.max(quantity.min(fit.max(0)))
}

/// REAL commit bookkeeping: fulfilled quantity after committing `reserved` units.
#[must_use]
pub fn real_fulfilment(ordered: i64, previously_fulfilled: i64, reserved: i64) -> i64 {
    ordered.min(previously_fulfilled + reserved)
}
