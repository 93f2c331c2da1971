//! Prometheus export of the engine's metrics.
//!
//! Engine code records through the `metrics` facade; this module installs the
//! Prometheus recorder and its HTTP listener once per process.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(#[from] BuildError),
    /// Failed to install metrics recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus metrics endpoint.
///
/// ```rust,no_run
/// use allotment_engine::metrics::MetricsServer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
/// server.start()?;
/// // Scrape http://localhost:9090/metrics
/// # Ok(())
/// # }
/// ```
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or a recorder
    /// is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )?
            .build()?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if the server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for every metric the engine records.
pub fn register_metrics() {
    describe_counter!("allocation.reserve.total", "Reserve and modify calls by outcome");
    describe_counter!("allocation.release.total", "Single-product releases");
    describe_counter!("allocation.commit.total", "Commit calls by outcome");
    describe_counter!(
        "allocation.commit.shortages",
        "Order lines rejected by all-or-nothing commits"
    );
    describe_histogram!(
        "allocation.commit.duration_seconds",
        "Time taken by successful commits"
    );
    describe_counter!("allocation.cancel.total", "Orders cancelled with stock released");
    describe_counter!("allocation.adjust.total", "Admin capacity edits by policy");
    describe_counter!("allocation.outbox.appended", "Outbox rows appended by event type");
    describe_counter!("allocation.expiry.deleted", "Expired tentative holds deleted");
    describe_gauge!(
        "allocation.audit.mismatches",
        "REAL ledger rows whose allocated_qty disagrees with their orders"
    );
    describe_counter!(
        "allocation.frame_retry.lines_progressed",
        "FRAME order lines that received more units"
    );
    describe_counter!("allocation.jobs.runs", "Background job runs");
    describe_counter!("allocation.jobs.failures", "Background job runs that failed");
    describe_counter!("allocation.store.lock_timeouts", "Row lock waits that timed out");
    describe_counter!(
        "allocation.store.conflicts",
        "Serialization failures and deadlocks by SQLSTATE"
    );
}
