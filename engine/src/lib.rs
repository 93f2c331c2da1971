//! # Allotment Engine
//!
//! Inventory reservation and allocation for a shop with two kinds of stock:
//!
//! - **REAL** products draw from physical stock at a location
//!   (`allocatable_qty - allocated_qty`).
//! - **FRAME** products draw from a sales quota (`sales_limit_total`) whose
//!   consumption is derived from the order lines placed against it.
//!
//! Shoppers place short-lived tentative holds while they shop
//! ([`AllocationEngine::reserve`]) and convert them to allocations when an
//! order is placed ([`AllocationEngine::commit`]). Background jobs delete
//! expired holds, re-check REAL ledger counters and retry FRAME lines that
//! could not be fulfilled at commit time.
//!
//! Every state change is paired with an outbox row in the same unit of work,
//! so downstream consumers see an event exactly when the change is durable.
//!
//! # Example
//!
//! ```rust,ignore
//! use allotment_engine::{AllocationEngine, AllocationSettings};
//! use allotment_core::environment::SystemClock;
//! use std::sync::Arc;
//!
//! let engine = AllocationEngine::new(store, Arc::new(SystemClock), AllocationSettings::default());
//! let outcome = engine.reserve(&session_id, product_id, 2).await?;
//! println!("{} left for other shoppers", outcome.effective_stock);
//! ```

pub mod calculator;
pub mod config;
pub mod engine;
pub mod frame_retry;
pub mod jobs;
pub mod metrics;
pub mod policy;
pub mod publisher;
pub mod scheduler;

pub use calculator::EffectiveStockCalculator;
pub use config::{Config, ConfigError};
pub use engine::{
    AllocationEngine, AllocationSettings, CancellationReceipt, CommitReceipt, ReservationOutcome,
};
pub use frame_retry::{FrameAllocationRetryService, FrameRetrySummary, OrderFrameProgress};
pub use jobs::{
    AuditReport, ConsistencyAuditJob, FrameRetryJob, LedgerMismatch, PeriodicJob,
    ReservationExpiryJob,
};
pub use policy::PolicyLedger;
pub use publisher::OutboxPublisher;
pub use scheduler::{JobScheduler, shutdown_signal};
