//! Runs [`PeriodicJob`]s until shutdown.
//!
//! Each job gets its own task and its own interval. A failed run is logged and
//! counted; the next tick runs again. Shutdown is broadcast to every task and
//! waited on with a timeout.

use crate::jobs::PeriodicJob;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Owns the background job tasks.
pub struct JobScheduler {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl JobScheduler {
    /// Create a scheduler that waits up to `shutdown_timeout` for jobs to stop.
    #[must_use]
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Start running `job` on its interval. The first run happens immediately.
    pub fn spawn<J: PeriodicJob + 'static>(&mut self, job: J) {
        let name = job.name();
        let period = job.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(job = name, interval_secs = period.as_secs(), "Job started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match job.run_once().await {
                            Ok(processed) => {
                                metrics::counter!("allocation.jobs.runs", "job" => name).increment(1);
                                tracing::debug!(job = name, processed, "Job run finished");
                            },
                            Err(e) => {
                                metrics::counter!("allocation.jobs.failures", "job" => name).increment(1);
                                error!(job = name, error = %e, "Job run failed");
                            },
                        }
                    }
                }
            }
            info!(job = name, "Job stopped");
        });

        self.tasks.push((name, handle));
    }

    /// Number of running jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every job to stop and wait for them.
    ///
    /// A run in progress finishes first. Jobs still running after the timeout
    /// are aborted.
    pub async fn shutdown(self) {
        info!(
            jobs = self.tasks.len(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Stopping background jobs"
        );
        if self.shutdown_tx.send(()).is_err() {
            warn!("No job was listening for shutdown");
        }

        let timeout = self.shutdown_timeout;
        let stops = self.tasks.into_iter().map(|(name, handle)| async move {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => error!(job = name, error = %e, "Job task ended abnormally"),
                Err(_) => {
                    warn!(job = name, "Job did not stop in time, aborting");
                    abort.abort();
                },
            }
        });
        futures::future::join_all(stops).await;
        info!("Background jobs stopped");
    }
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
