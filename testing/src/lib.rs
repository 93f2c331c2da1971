//! # Allotment Testing
//!
//! Testing utilities for the Allotment allocation engine.
//!
//! This crate provides:
//! - [`InMemoryAllocationStore`]: a transactional, in-process implementation of
//!   the storage seam with rollback-on-drop and commit failure injection
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Fixtures for products and orders
//! - `proptest` strategies for quantities and order shapes
//!
//! ## Example
//!
//! ```
//! use allotment_testing::{InMemoryAllocationStore, fixtures};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryAllocationStore::new();
//! let product = fixtures::real_product("Mug");
//! store.add_product(product.clone()).await;
//! store.set_allocatable(product.id, 10).await;
//!
//! let row = store.location_stock(product.id).await;
//! assert_eq!(row.map(|r| r.allocatable_qty), Some(10));
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use allotment_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod fixtures;
pub mod store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use allotment_testing::mocks::FixedClock;
    /// use allotment_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when a test moves it.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the engine.
    ///
    /// ```
    /// use allotment_testing::mocks::ManualClock;
    /// use allotment_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::starting_at(allotment_testing::test_clock().now());
    /// let engine_clock = clock.clone();
    /// clock.advance(Duration::minutes(31));
    /// assert_eq!(engine_clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers.
pub mod helpers {
    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Safe to call from every test; only the first call installs it.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("allotment=debug")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// A positive quantity a shopper might put in a cart.
    pub fn quantity() -> impl Strategy<Value = i64> {
        1i64..=12
    }

    /// Cart shapes: per-product quantities for up to `max_lines` products.
    pub fn cart(max_lines: usize) -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(quantity(), 1..=max_lines)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use store::{InMemoryAllocationStore, InMemoryUnitOfWork};
