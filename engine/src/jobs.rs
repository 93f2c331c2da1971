//! Periodic maintenance jobs.
//!
//! Each job does one bounded unit of work per run and reports how many rows it
//! touched. Scheduling lives in [`crate::scheduler`].

use crate::frame_retry::FrameAllocationRetryService;
use allotment_core::environment::Clock;
use allotment_core::error::AllocationError;
use allotment_core::ids::{LocationId, ProductId};
use allotment_core::store::{AllocationStore, Isolation, UnitOfWork};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A job run on a fixed interval.
pub trait PeriodicJob: Send + Sync {
    /// Name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Time between runs.
    fn interval(&self) -> Duration;

    /// Run once and return the number of rows processed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError`] if the run failed; its unit of work was rolled back.
    fn run_once(&self) -> impl Future<Output = Result<u64, AllocationError>> + Send;
}

/// Deletes tentative holds whose `expires_at` has passed.
pub struct ReservationExpiryJob<S> {
    store: S,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl<S: AllocationStore> ReservationExpiryJob<S> {
    /// Create the sweep.
    #[must_use]
    pub fn new(store: S, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// Delete every expired tentative hold.
    ///
    /// A hold renewed after `now` was read keeps a later `expires_at` and
    /// survives.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Store`] on storage failure.
    pub async fn sweep(&self) -> Result<u64, AllocationError> {
        let now = self.clock.now();
        let mut uow = self.store.begin(Isolation::ReadCommitted).await?;
        let deleted = uow.delete_expired_tentatives(now).await?;
        uow.commit().await?;

        metrics::counter!("allocation.expiry.deleted").increment(deleted);
        if deleted > 0 {
            info!(deleted, "Expired reservations deleted");
        } else {
            debug!("No expired reservations");
        }
        Ok(deleted)
    }
}

impl<S: AllocationStore> PeriodicJob for ReservationExpiryJob<S> {
    fn name(&self) -> &'static str {
        "reservation_expiry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<u64, AllocationError> {
        self.sweep().await
    }
}

/// A REAL ledger row whose cached counter disagrees with its orders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerMismatch {
    /// Product of the ledger row
    pub product_id: ProductId,
    /// Location of the ledger row
    pub location_id: LocationId,
    /// `allocated_qty` stored on the ledger
    pub allocated_qty: i64,
    /// Sum of fulfilled quantities over non-cancelled order lines
    pub order_fulfilled_qty: i64,
}

impl LedgerMismatch {
    /// `allocated_qty - order_fulfilled_qty`
    #[must_use]
    pub const fn drift(&self) -> i64 {
        self.allocated_qty - self.order_fulfilled_qty
    }
}

/// Outcome of one audit run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Ledger rows compared
    pub rows_checked: u64,
    /// Rows that disagree
    pub mismatches: Vec<LedgerMismatch>,
}

impl AuditReport {
    /// Whether every row matched.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compares REAL `allocated_qty` counters with order-derived totals.
///
/// Reports only; nothing is corrected.
pub struct ConsistencyAuditJob<S> {
    store: S,
    interval: Duration,
}

impl<S: AllocationStore> ConsistencyAuditJob<S> {
    /// Create the audit.
    #[must_use]
    pub const fn new(store: S, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Compare every REAL ledger row from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Store`] on storage failure.
    #[tracing::instrument(skip_all)]
    pub async fn audit(&self) -> Result<AuditReport, AllocationError> {
        let mut uow = self.store.begin(Isolation::RepeatableRead).await?;
        let rows = uow.real_ledger_audit_rows().await?;
        uow.commit().await?;

        let rows_checked = rows.len() as u64;
        let mismatches: Vec<LedgerMismatch> = rows
            .into_iter()
            .filter(|row| row.allocated_qty != row.order_fulfilled_qty)
            .map(|row| LedgerMismatch {
                product_id: row.product_id,
                location_id: row.location_id,
                allocated_qty: row.allocated_qty,
                order_fulfilled_qty: row.order_fulfilled_qty,
            })
            .collect();

        for mismatch in &mismatches {
            warn!(
                product_id = %mismatch.product_id,
                location_id = mismatch.location_id.get(),
                allocated_qty = mismatch.allocated_qty,
                order_fulfilled_qty = mismatch.order_fulfilled_qty,
                drift = mismatch.drift(),
                "Ledger drift detected"
            );
        }
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("allocation.audit.mismatches").set(mismatches.len() as f64);
        info!(rows_checked, mismatches = mismatches.len(), "Consistency audit finished");

        Ok(AuditReport {
            rows_checked,
            mismatches,
        })
    }
}

impl<S: AllocationStore> PeriodicJob for ConsistencyAuditJob<S> {
    fn name(&self) -> &'static str {
        "consistency_audit"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<u64, AllocationError> {
        let report = self.audit().await?;
        Ok(report.mismatches.len() as u64)
    }
}

/// Periodic wrapper around [`FrameAllocationRetryService::allocate_all_pending`].
pub struct FrameRetryJob<S> {
    service: FrameAllocationRetryService<S>,
    interval: Duration,
}

impl<S: AllocationStore> FrameRetryJob<S> {
    /// Create the job.
    #[must_use]
    pub const fn new(service: FrameAllocationRetryService<S>, interval: Duration) -> Self {
        Self { service, interval }
    }
}

impl<S: AllocationStore> PeriodicJob for FrameRetryJob<S> {
    fn name(&self) -> &'static str {
        "frame_retry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<u64, AllocationError> {
        let summary = self.service.allocate_all_pending().await?;
        if summary.failures > 0 {
            warn!(failures = summary.failures, "Some orders could not be retried");
        }
        Ok(summary.lines_progressed)
    }
}
