//! Shared setup for engine behaviour tests.

#![allow(dead_code)] // Each test binary uses a different subset
#![allow(clippy::expect_used)] // Tests can expect

use allotment_core::event::InventoryEvent;
use allotment_core::model::Product;
use allotment_engine::{AllocationEngine, AllocationSettings};
use allotment_testing::{InMemoryAllocationStore, ManualClock, fixtures, helpers, test_clock};
use allotment_core::environment::Clock;
use std::sync::Arc;

/// Engine wired to an in-memory store and a clock the test controls.
pub struct Harness {
    pub store: InMemoryAllocationStore,
    pub clock: ManualClock,
    pub engine: Arc<AllocationEngine<InMemoryAllocationStore>>,
}

impl Harness {
    pub fn new() -> Self {
        helpers::init_tracing();
        let store = InMemoryAllocationStore::new();
        let clock = ManualClock::starting_at(test_clock().now());
        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            Arc::new(clock.clone()),
            AllocationSettings::default(),
        ));
        Self {
            store,
            clock,
            engine,
        }
    }

    /// A REAL product with `allocatable` units at the default location.
    pub async fn real_product(&self, name: &str, allocatable: i64) -> Product {
        let product = fixtures::real_product(name);
        self.store.add_product(product.clone()).await;
        self.store.set_allocatable(product.id, allocatable).await;
        product
    }

    /// A FRAME product with a sales limit of `limit`.
    pub async fn frame_product(&self, name: &str, limit: i64) -> Product {
        let product = fixtures::frame_product(name);
        self.store.add_product(product.clone()).await;
        self.store.set_sales_limit(product.id, limit).await;
        product
    }

    /// Every outbox event, decoded, in write order.
    pub async fn events(&self) -> Vec<InventoryEvent> {
        self.store
            .outbox()
            .await
            .iter()
            .map(|record| record.decode::<InventoryEvent>().expect("outbox payload decodes"))
            .collect()
    }

    pub async fn effective(&self, product: &Product) -> i64 {
        self.engine
            .effective_stock(product.id)
            .await
            .expect("effective stock of a known product")
    }
}
