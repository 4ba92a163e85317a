use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::bulk::{BulkOperationOrchestrator, CancelError, OperationId};

/// What a graceful shutdown managed to settle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Operations that accepted the cancel request.
    pub cancelled: Vec<OperationId>,
    /// Operations still draining in-flight units when the grace period ran out.
    pub still_running: Vec<OperationId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.still_running.is_empty()
    }
}

/// Graceful shutdown coordinator for Shopfloor
pub struct ShutdownCoordinator {
    orchestrator: Arc<BulkOperationOrchestrator>,
}

impl ShutdownCoordinator {
    pub fn new(orchestrator: Arc<BulkOperationOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Wait for SIGINT (Ctrl-C).
    pub async fn wait_for_signal() -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        Ok(())
    }

    /// Cancels every running bulk operation, then waits up to `grace` for
    /// their in-flight units to drain.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        info!(grace_ms = grace.as_millis() as u64, "Initiating graceful shutdown of bulk operations...");

        let mut report = ShutdownReport::default();
        let running = self.orchestrator.running();
        for id in &running {
            match self.orchestrator.cancel(*id) {
                Ok(()) => report.cancelled.push(*id),
                // Finished between listing and cancelling.
                Err(CancelError::NotCancellable { .. }) => {}
                Err(error) => warn!(operation.id = %id, error = %error, "Failed to cancel operation"),
            }
        }

        let deadline = Instant::now() + grace;
        let tracker = self.orchestrator.tracker();
        for id in running {
            match timeout_at(deadline, tracker.wait_for_terminal(id)).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(operation.id = %id, "Operation still draining after grace period");
                    report.still_running.push(id);
                }
            }
        }

        self.orchestrator.gateway().metrics().log_stats();

        if report.is_clean() {
            info!(cancelled = report.cancelled.len(), "Graceful shutdown completed successfully");
        } else {
            warn!(
                still_running = report.still_running.len(),
                "Graceful shutdown finished with operations still in flight"
            );
        }
        report
    }
}
