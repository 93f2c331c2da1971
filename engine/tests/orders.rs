//! Commit and cancellation behaviour.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests are allowed to panic on failures

mod common;

use allotment_core::environment::Clock;
use allotment_core::error::AllocationError;
use allotment_core::event::{AvailabilityReason, InventoryEvent};
use allotment_core::ids::{OrderId, ProductId, SessionId};
use allotment_core::model::{OrderStatus, StockReservation};
use allotment_core::store::StoreError;
use allotment_testing::{fixtures, properties};
use chrono::Duration;
use common::Harness;
use proptest::prelude::*;

/// Seed a hold directly, bypassing the reserve-time check.
async fn seed_hold(h: &Harness, session: &SessionId, product_id: ProductId, quantity: i64) {
    let now = h.clock.now();
    h.store
        .put_reservation(StockReservation::tentative(
            product_id,
            session.clone(),
            quantity,
            now,
            now + Duration::minutes(30),
        ))
        .await;
}

#[tokio::test]
async fn frame_commit_reports_the_exact_shortfall() {
    for (requested, expect_ok) in [(6, false), (5, true)] {
        let h = Harness::new();
        let poster = h.frame_product("Poster", 20).await;
        h.store
            .add_order(fixtures::fulfilled_order(h.clock.now(), &[(poster.id, 15)]))
            .await;
        let cart = SessionId::from("cart");
        seed_hold(&h, &cart, poster.id, requested).await;
        let order = fixtures::pending_order(h.clock.now(), &[(poster.id, requested)]);
        h.store.add_order(order.clone()).await;

        let result = h.engine.commit(&cart, order.id).await;

        if expect_ok {
            let receipt = result.unwrap();
            assert_eq!(receipt.lines.len(), 1);
            assert_eq!(receipt.lines[0].quantity, 5);
            assert_eq!(receipt.lines[0].fulfilled_quantity, 0);
            assert!(h.store.reservations().await.is_empty());
        } else {
            let Err(AllocationError::OutOfStock { shortages }) = result else {
                panic!("expected OutOfStock, got {result:?}");
            };
            assert_eq!(shortages.len(), 1);
            assert_eq!(shortages[0].product_name, "Poster");
            assert_eq!((shortages[0].requested, shortages[0].available), (6, 5));
        }
    }
}

#[tokio::test]
async fn commit_is_all_or_nothing_and_lists_every_shortage() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 5).await;
    let pen = h.real_product("Pen", 10).await;
    let poster = h.frame_product("Poster", 3).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 4).await.unwrap();
    h.engine.reserve(&cart, pen.id, 1).await.unwrap();
    h.engine.reserve(&cart, poster.id, 3).await.unwrap();

    // Capacity shrinks underneath the holds.
    h.engine.adjust_stock(mug.id, -3, "damaged", "ops").await.unwrap();
    h.engine.set_capacity(poster.id, 1, "quota cut", "ops").await.unwrap();
    let events_before = h.store.outbox().await.len();

    let order = fixtures::pending_order(h.clock.now(), &[(mug.id, 4), (pen.id, 1), (poster.id, 3)]);
    h.store.add_order(order.clone()).await;
    let result = h.engine.commit(&cart, order.id).await;

    let Err(error) = result else {
        panic!("commit should fail");
    };
    assert_eq!(error.code(), "OUT_OF_STOCK");
    let AllocationError::OutOfStock { mut shortages } = error else {
        unreachable!();
    };
    shortages.sort_by(|a, b| a.product_name.cmp(&b.product_name));
    let summary: Vec<_> = shortages
        .iter()
        .map(|s| (s.product_name.as_str(), s.requested, s.available))
        .collect();
    assert_eq!(summary, vec![("Mug", 4, 2), ("Poster", 3, 1)]);

    assert_eq!(h.store.location_stock(mug.id).await.unwrap().allocated_qty, 0);
    assert_eq!(h.store.location_stock(pen.id).await.unwrap().allocated_qty, 0);
    assert_eq!(h.store.reservations().await.len(), 3);
    let stored = h.store.order(order.id).await.unwrap();
    assert!(stored.items.iter().all(|item| item.fulfilled_quantity == 0));
    assert_eq!(h.store.outbox().await.len(), events_before);
}

#[tokio::test]
async fn commit_moves_holds_onto_the_order() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let poster = h.frame_product("Poster", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 2).await.unwrap();
    h.engine.reserve(&cart, poster.id, 4).await.unwrap();
    let order = fixtures::pending_order(h.clock.now(), &[(mug.id, 2), (poster.id, 4)]);
    h.store.add_order(order.clone()).await;

    let receipt = h.engine.commit(&cart, order.id).await.unwrap();
    assert_eq!(receipt.order_id, order.id);

    assert!(h.store.reservations().await.is_empty());
    assert_eq!(h.store.location_stock(mug.id).await.unwrap().allocated_qty, 2);
    let stored = h.store.order(order.id).await.unwrap();
    assert_eq!(stored.item_for(mug.id).unwrap().fulfilled_quantity, 2);
    assert_eq!(stored.item_for(poster.id).unwrap().fulfilled_quantity, 0);

    // The order's own FRAME line now consumes the quota.
    assert_eq!(h.effective(&poster).await, 6);
    assert_eq!(h.effective(&mug).await, 8);

    let events = h.events().await;
    assert!(matches!(
        events.last(),
        Some(InventoryEvent::OrderStockCommitted { order_id, lines, .. })
            if *order_id == order.id && lines.len() == 2
    ));
}

#[tokio::test]
async fn commit_preconditions() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");

    let missing = OrderId::new();
    assert!(matches!(
        h.engine.commit(&cart, missing).await,
        Err(AllocationError::OrderNotFound(id)) if id == missing
    ));

    let order = fixtures::pending_order(h.clock.now(), &[(mug.id, 1)]);
    h.store.add_order(order.clone()).await;
    assert!(matches!(
        h.engine.commit(&cart, order.id).await,
        Err(AllocationError::NoReservations(_))
    ));

    let other = h.real_product("Other", 10).await;
    h.engine.reserve(&cart, other.id, 1).await.unwrap();
    assert!(matches!(
        h.engine.commit(&cart, order.id).await,
        Err(AllocationError::ItemNotFound(id)) if id == other.id
    ));

    h.store.set_order_status(order.id, OrderStatus::Cancelled).await;
    assert!(matches!(
        h.engine.commit(&cart, order.id).await,
        Err(AllocationError::AlreadyCancelled(_))
    ));
}

#[tokio::test]
async fn failed_commit_leaves_no_trace_in_state_or_outbox() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 3).await.unwrap();
    let order = fixtures::pending_order(h.clock.now(), &[(mug.id, 3)]);
    h.store.add_order(order.clone()).await;
    let events_before = h.store.outbox().await.len();

    h.store.fail_next_commit();
    let result = h.engine.commit(&cart, order.id).await;
    assert!(matches!(result, Err(AllocationError::Store(StoreError::Database(_)))));

    assert_eq!(h.store.location_stock(mug.id).await.unwrap().allocated_qty, 0);
    assert_eq!(h.store.reservations().await.len(), 1);
    assert_eq!(h.store.outbox().await.len(), events_before);

    h.engine.commit(&cart, order.id).await.unwrap();
    let committed = h
        .events()
        .await
        .into_iter()
        .filter(|e| matches!(e, InventoryEvent::OrderStockCommitted { .. }))
        .count();
    assert_eq!(committed, 1);
}

#[tokio::test]
async fn cancellation_restores_real_capacity() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 3).await.unwrap();
    let order = fixtures::pending_order(h.clock.now(), &[(mug.id, 3)]);
    h.store.add_order(order.clone()).await;
    h.engine.commit(&cart, order.id).await.unwrap();
    h.store.set_order_status(order.id, OrderStatus::Confirmed).await;
    assert_eq!(h.store.location_stock(mug.id).await.unwrap().remaining(), 7);

    let receipt = h.engine.release_committed(order.id).await.unwrap();

    assert_eq!(receipt.released.len(), 1);
    assert_eq!(receipt.released[0].freed, 3);
    assert_eq!(h.store.location_stock(mug.id).await.unwrap().remaining(), 10);
    let stored = h.store.order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(stored.items[0].fulfilled_quantity, 0);

    let events = h.events().await;
    assert!(events.contains(&InventoryEvent::StockAvailabilityIncreased {
        product_id: mug.id,
        reason: AvailabilityReason::OrderCancelled,
        increased_by: 3,
        order_id: Some(order.id),
    }));
    assert!(matches!(events.last(), Some(InventoryEvent::OrderCancelled { .. })));

    assert!(matches!(
        h.engine.release_committed(order.id).await,
        Err(AllocationError::AlreadyCancelled(_))
    ));
}

#[tokio::test]
async fn cancelling_a_frame_order_frees_its_quota() {
    let h = Harness::new();
    let poster = h.frame_product("Poster", 10).await;
    let order = fixtures::fulfilled_order(h.clock.now(), &[(poster.id, 4)]);
    h.store.add_order(order.clone()).await;
    assert_eq!(h.effective(&poster).await, 6);

    h.engine.release_committed(order.id).await.unwrap();

    assert_eq!(h.effective(&poster).await, 10);
    assert!(h.events().await.contains(&InventoryEvent::StockAvailabilityIncreased {
        product_id: poster.id,
        reason: AvailabilityReason::OrderCancelled,
        increased_by: 4,
        order_id: Some(order.id),
    }));
}

#[tokio::test]
async fn shipped_orders_cannot_be_cancelled() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let order = fixtures::order(OrderStatus::Shipped, h.clock.now(), &[(mug.id, 1)]);
    h.store.add_order(order.clone()).await;

    let result = h.engine.release_committed(order.id).await;
    assert!(matches!(
        result,
        Err(AllocationError::OrderNotCancellable {
            status: OrderStatus::Shipped,
            ..
        })
    ));
    assert!(matches!(
        h.engine.release_committed(OrderId::new()).await,
        Err(AllocationError::OrderNotFound(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn sequential_shoppers_never_oversell(cart in properties::cart(12), stock in 0i64..30) {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        runtime.block_on(async {
            let h = Harness::new();
            let mug = h.real_product("Mug", stock).await;

            let mut granted = 0;
            for (i, quantity) in cart.iter().enumerate() {
                let session = SessionId::new(format!("shopper-{i}"));
                if h.engine.reserve(&session, mug.id, *quantity).await.is_ok() {
                    granted += quantity;
                }
            }

            prop_assert!(granted <= stock);
            prop_assert_eq!(h.effective(&mug).await, stock - granted);
            Ok(())
        })?;
    }
}
