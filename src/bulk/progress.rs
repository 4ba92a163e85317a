use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use super::registry::{OperationCell, OperationRegistry};
use super::types::{BulkOperation, BulkStatus, OperationId, OperationProgress, OperationResult};
use crate::workflow::EntityId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("Unknown operation {0}")]
    UnknownOperation(OperationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

/// Counters of one batch without the per-target result map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub operation_id: OperationId,
    pub status: BulkStatus,
    pub cancel_requested: bool,
    pub total: usize,
    pub completed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
}

impl ProgressView {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed_count as f64 * 100.0 / self.total as f64
    }
}

impl From<&BulkOperation> for ProgressView {
    fn from(operation: &BulkOperation) -> Self {
        Self {
            operation_id: operation.id,
            status: operation.status,
            cancel_requested: operation.cancel_requested,
            total: operation.progress.total,
            completed_count: operation.progress.completed_count,
            success_count: operation.progress.success_count,
            error_count: operation.progress.error_count,
        }
    }
}

/// Delivered to subscribers once per completed unit and once on the
/// terminal transition (with `unit` empty).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub view: ProgressView,
    pub unit: Option<(EntityId, OperationResult)>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.unit.is_none() && self.view.status.is_terminal()
    }
}

/// Callbacks run on the batch's aggregator task; keep them short.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Read side of the orchestrator: snapshots, callbacks and watch channels.
///
/// Every read reflects a state the batch actually passed through, so a
/// reader never observes counts going down or a terminal status followed by
/// a non-terminal one.
#[derive(Clone)]
pub struct OperationProgressTracker {
    registry: Arc<OperationRegistry>,
}

impl OperationProgressTracker {
    pub(crate) fn new(registry: Arc<OperationRegistry>) -> Self {
        Self { registry }
    }

    fn cell(&self, id: OperationId) -> Result<Arc<OperationCell>, TrackerError> {
        self.registry.get(&id).ok_or(TrackerError::UnknownOperation(id))
    }

    pub fn snapshot(&self, id: OperationId) -> Result<OperationProgress, TrackerError> {
        Ok(self.cell(id)?.snapshot().progress)
    }

    pub fn view(&self, id: OperationId) -> Result<ProgressView, TrackerError> {
        Ok(self.cell(id)?.view())
    }

    /// Registers a progress callback. Subscribing to a finished operation
    /// invokes the callback once with the terminal view.
    pub fn subscribe<F>(&self, id: OperationId, callback: F) -> Result<SubscriptionId, TrackerError>
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let cell = self.cell(id)?;
        let subscription = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        cell.subscribe(subscription, Arc::new(callback));
        Ok(subscription)
    }

    /// Returns whether the subscription was still registered.
    pub fn unsubscribe(&self, id: OperationId, subscription: SubscriptionId) -> Result<bool, TrackerError> {
        Ok(self.cell(id)?.unsubscribe(subscription))
    }

    /// Watch channel over the full operation record.
    pub fn watch(&self, id: OperationId) -> Result<watch::Receiver<BulkOperation>, TrackerError> {
        Ok(self.cell(id)?.watch())
    }

    pub async fn wait_for_terminal(&self, id: OperationId) -> Result<BulkOperation, TrackerError> {
        let cell = self.cell(id)?;
        let mut receiver = cell.watch();
        let finished = receiver
            .wait_for(BulkOperation::is_terminal)
            .await
            .map_err(|_| TrackerError::UnknownOperation(id))?
            .clone();
        Ok(finished)
    }
}
