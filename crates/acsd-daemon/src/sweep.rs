//! Periodic timeout sweeper.
//!
//! A background task that reconciles overdue `Sent` tasks on a fixed
//! cadence. Each flip is a compare-and-swap inside the store, so the
//! sweeper is safe to run concurrently with active dispatch and device
//! responses; running it twice in a row is harmless.

use std::sync::Arc;
use std::time::Duration;

use acsd_core::task::TaskManager;
use chrono::Utc;
use tokio::sync::watch;

/// Background worker flipping overdue tasks to their timeout state.
pub struct TimeoutSweeper {
    manager: Arc<TaskManager>,
    interval: Duration,
}

impl TimeoutSweeper {
    /// Creates a sweeper over the given manager.
    #[must_use]
    pub fn new(manager: Arc<TaskManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Sweep failures are logged and retried on the next tick; a transient
    /// store error must not kill the reconciliation loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so startup isn't
        // dominated by a sweep racing schema initialization.
        ticker.tick().await;
        tracing::info!(interval_secs = self.interval.as_secs(), "timeout sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once(),
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("timeout sweeper stopping");
                        return;
                    }
                },
            }
        }
    }

    fn sweep_once(&self) {
        match self.manager.sweep_timeouts(Utc::now()) {
            Ok(outcome) => {
                if outcome.failed > 0 || outcome.verifying > 0 {
                    tracing::info!(
                        failed = outcome.failed,
                        verifying = outcome.verifying,
                        "timeout sweep reconciled overdue tasks"
                    );
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "timeout sweep failed");
            },
        }
    }
}
