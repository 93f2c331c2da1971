//! Tentative hold behaviour: reserve, modify, release, expiry.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

mod common;

use allotment_core::environment::Clock;
use allotment_core::error::AllocationError;
use allotment_core::ids::{ProductId, SessionId};
use allotment_engine::ReservationExpiryJob;
use allotment_engine::jobs::PeriodicJob;
use allotment_testing::fixtures;
use chrono::Duration;
use common::Harness;
use std::sync::Arc;

#[tokio::test]
async fn reserve_then_commit_walkthrough() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let alice = SessionId::from("alice");
    let bob = SessionId::from("bob");

    let first = h.engine.reserve(&alice, mug.id, 6).await.unwrap();
    assert_eq!(first.effective_stock, 4);
    assert_eq!(first.reservation.quantity, 6);

    let rejected = h.engine.reserve(&bob, mug.id, 5).await;
    assert!(matches!(
        rejected,
        Err(AllocationError::InsufficientStock {
            requested: 5,
            available: 4,
            ..
        })
    ));

    let second = h.engine.reserve(&bob, mug.id, 4).await.unwrap();
    assert_eq!(second.effective_stock, 0);

    let order = fixtures::pending_order(h.clock.now(), &[(mug.id, 6)]);
    h.store.add_order(order.clone()).await;
    h.engine.commit(&alice, order.id).await.unwrap();

    let ledger = h.store.location_stock(mug.id).await.unwrap();
    assert_eq!(ledger.allocated_qty, 6);
    assert_eq!(h.effective(&mug).await, 0);
}

#[tokio::test]
async fn reserving_again_adds_to_the_existing_hold() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");

    h.engine.reserve(&cart, mug.id, 2).await.unwrap();
    let outcome = h.engine.reserve(&cart, mug.id, 3).await.unwrap();

    assert_eq!(outcome.reservation.quantity, 5);
    assert_eq!(outcome.effective_stock, 5);
    assert_eq!(h.store.reservations().await.len(), 1);
}

#[tokio::test]
async fn additive_reserve_only_checks_the_extra_units() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");

    h.engine.reserve(&cart, mug.id, 8).await.unwrap();
    let rejected = h.engine.reserve(&cart, mug.id, 3).await;

    assert!(matches!(
        rejected,
        Err(AllocationError::InsufficientStock {
            requested: 3,
            available: 2,
            ..
        })
    ));
    let holds = h.store.reservations().await;
    assert_eq!(holds[0].quantity, 8);
}

#[tokio::test]
async fn additive_reserve_rejects_totals_past_the_integer_range() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 1).await.unwrap();

    let result = h.engine.reserve(&cart, mug.id, i64::MAX).await;

    assert!(matches!(
        result,
        Err(AllocationError::InsufficientStock {
            requested: i64::MAX,
            available: 9,
            ..
        })
    ));
    assert_eq!(h.store.reservations().await[0].quantity, 1);
}

#[tokio::test]
async fn modify_checks_only_the_increase() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 4).await.unwrap();

    let grown = h.engine.modify(&cart, mug.id, 10).await.unwrap();
    assert_eq!(grown.effective_stock, 0);

    let too_many = h.engine.modify(&cart, mug.id, 11).await;
    assert!(matches!(
        too_many,
        Err(AllocationError::InsufficientStock {
            requested: 1,
            available: 0,
            ..
        })
    ));

    let shrunk = h.engine.modify(&cart, mug.id, 2).await.unwrap();
    assert_eq!(shrunk.reservation.quantity, 2);
    assert_eq!(shrunk.effective_stock, 8);
}

#[tokio::test]
async fn modify_slides_the_expiry() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    let created = h.engine.reserve(&cart, mug.id, 1).await.unwrap();
    assert_eq!(
        created.reservation.expires_at,
        Some(h.clock.now() + Duration::minutes(30))
    );

    h.clock.advance(Duration::minutes(20));
    let modified = h.engine.modify(&cart, mug.id, 2).await.unwrap();

    assert_eq!(
        modified.reservation.expires_at,
        Some(h.clock.now() + Duration::minutes(30))
    );
    assert_eq!(modified.reservation.id, created.reservation.id);
}

#[tokio::test]
async fn modify_without_a_hold_is_not_found() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;

    let result = h.engine.modify(&SessionId::from("nobody"), mug.id, 1).await;
    assert!(matches!(result, Err(AllocationError::ReservationNotFound { .. })));
}

#[tokio::test]
async fn bad_requests_are_rejected_before_touching_stock() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");

    assert!(matches!(
        h.engine.reserve(&cart, mug.id, 0).await,
        Err(AllocationError::InvalidQuantity(0))
    ));
    assert!(matches!(
        h.engine.modify(&cart, mug.id, -1).await,
        Err(AllocationError::InvalidQuantity(-1))
    ));

    let unknown = ProductId::new();
    assert!(matches!(
        h.engine.reserve(&cart, unknown, 1).await,
        Err(AllocationError::ItemNotFound(id)) if id == unknown
    ));
    assert!(h.store.reservations().await.is_empty());
}

#[tokio::test]
async fn release_is_idempotent() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 3).await.unwrap();

    assert!(h.engine.release(&cart, mug.id).await.unwrap());
    assert!(!h.engine.release(&cart, mug.id).await.unwrap());
    assert_eq!(h.effective(&mug).await, 10);
}

#[tokio::test]
async fn release_all_clears_only_that_session() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let poster = h.frame_product("Poster", 10).await;
    let cart = SessionId::from("cart");
    let other = SessionId::from("other");
    h.engine.reserve(&cart, mug.id, 1).await.unwrap();
    h.engine.reserve(&cart, poster.id, 2).await.unwrap();
    h.engine.reserve(&other, mug.id, 3).await.unwrap();

    assert_eq!(h.engine.release_all(&cart).await.unwrap(), 2);
    assert_eq!(h.engine.release_all(&cart).await.unwrap(), 0);

    assert!(h.engine.session_reservations(&cart).await.unwrap().is_empty());
    assert_eq!(h.engine.session_reservations(&other).await.unwrap().len(), 1);
    assert_eq!(h.effective(&mug).await, 7);
}

#[tokio::test]
async fn expired_holds_stop_counting_before_the_sweep() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    let cart = SessionId::from("cart");
    h.engine.reserve(&cart, mug.id, 6).await.unwrap();

    h.clock.advance(Duration::minutes(31));

    assert_eq!(h.store.reservations().await.len(), 1);
    assert_eq!(h.effective(&mug).await, 10);
    assert!(h.engine.session_reservations(&cart).await.unwrap().is_empty());

    // An expired hold cannot be modified; reserving starts a fresh one.
    assert!(matches!(
        h.engine.modify(&cart, mug.id, 1).await,
        Err(AllocationError::ReservationNotFound { .. })
    ));
    let fresh = h.engine.reserve(&cart, mug.id, 10).await.unwrap();
    assert_eq!(fresh.effective_stock, 0);
}

#[tokio::test]
async fn expiry_job_deletes_only_expired_holds() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;
    h.engine.reserve(&SessionId::from("early"), mug.id, 2).await.unwrap();
    h.clock.advance(Duration::minutes(20));
    h.engine.reserve(&SessionId::from("late"), mug.id, 3).await.unwrap();
    h.clock.advance(Duration::minutes(15));

    let job = ReservationExpiryJob::new(
        h.store.clone(),
        Arc::new(h.clock.clone()),
        std::time::Duration::from_secs(300),
    );
    assert_eq!(job.name(), "reservation_expiry");
    assert_eq!(job.run_once().await.unwrap(), 1);
    assert_eq!(job.run_once().await.unwrap(), 0);

    let remaining = h.store.reservations().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, SessionId::from("late"));
}

#[tokio::test]
async fn frame_holds_count_against_the_quota() {
    let h = Harness::new();
    let poster = h.frame_product("Poster", 20).await;
    h.store
        .add_order(fixtures::fulfilled_order(h.clock.now(), &[(poster.id, 15)]))
        .await;

    let outcome = h
        .engine
        .reserve(&SessionId::from("cart"), poster.id, 3)
        .await
        .unwrap();
    assert_eq!(outcome.effective_stock, 2);

    let rejected = h.engine.reserve(&SessionId::from("other"), poster.id, 3).await;
    assert!(matches!(
        rejected,
        Err(AllocationError::InsufficientStock { available: 2, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let h = Harness::new();
    let mug = h.real_product("Mug", 10).await;

    let handles: Vec<_> = (0..25)
        .map(|i| {
            let engine = Arc::clone(&h.engine);
            let product_id = mug.id;
            tokio::spawn(async move {
                engine
                    .reserve(&SessionId::new(format!("shopper-{i}")), product_id, 1)
                    .await
            })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        match handle.await.expect("reserve task panicked") {
            Ok(_) => granted += 1,
            Err(e) => assert!(e.is_capacity_conflict(), "unexpected error: {e}"),
        }
    }

    assert_eq!(granted, 10);
    assert_eq!(h.effective(&mug).await, 0);
    let held: i64 = h.store.reservations().await.iter().map(|r| r.quantity).sum();
    assert_eq!(held, 10);
}
