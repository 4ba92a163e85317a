use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::progress::OperationProgressTracker;
use super::registry::{OperationCell, OperationRegistry};
use super::types::{
    BulkOperation, BulkStatus, CancelError, OperationId, OperationResult, OperationType, RemoveError, SubmitError,
    UnitError,
};
use crate::config::EngineConfig;
use crate::gateway::{ActionGateway, GatewayRequest};
use crate::observability::OperationTimer;
use crate::telemetry::create_operation_span;
use crate::workflow::EntityId;

/// Everything a worker needs to dispatch units of one batch.
struct Dispatch {
    gateway: Arc<ActionGateway>,
    targets: Vec<EntityId>,
    operation_type: OperationType,
    payload: Value,
    cursor: AtomicUsize,
    cancel: CancellationToken,
    /// Fired when a unit hits an unrecoverable gateway error.
    abort: CancellationToken,
    deadline: Option<Instant>,
}

impl Dispatch {
    /// Claims the next target in input order, or `None` once the batch must
    /// stop dispatching.
    fn next_target(&self) -> Option<&EntityId> {
        if self.cancel.is_cancelled() || self.abort.is_cancelled() || self.deadline_passed() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.targets.get(index)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Closes the cursor and returns the targets no worker claimed.
    fn close(&self) -> &[EntityId] {
        let claimed = self.cursor.swap(self.targets.len(), Ordering::SeqCst);
        &self.targets[claimed.min(self.targets.len())..]
    }

    async fn run_unit(&self, target: &EntityId) -> OperationResult {
        let request = GatewayRequest::new(
            target.clone(),
            self.operation_type.mutation_kind(),
            self.payload.clone(),
        );

        match self.gateway.invoke(request).await {
            Ok(_) => OperationResult::Success,
            Err(error) => {
                if error.is_unrecoverable() {
                    error!(entity.id = %target, error = %error, "Unrecoverable gateway error, aborting batch");
                    self.abort.cancel();
                }
                OperationResult::Error { reason: error.into() }
            }
        }
    }
}

/// Runs administrative actions over many entities with bounded concurrency.
///
/// Units of one batch start in input order; completion order is whatever the
/// store produces. A unit failure never stops its siblings, except for a
/// misconfigured gateway, which aborts the rest of the batch.
pub struct BulkOperationOrchestrator {
    gateway: Arc<ActionGateway>,
    registry: Arc<OperationRegistry>,
    concurrency: usize,
    batch_timeout: Option<Duration>,
}

impl BulkOperationOrchestrator {
    pub const DEFAULT_CONCURRENCY: usize = 4;

    pub fn new(gateway: Arc<ActionGateway>) -> Self {
        Self {
            gateway,
            registry: Arc::new(OperationRegistry::default()),
            concurrency: Self::DEFAULT_CONCURRENCY,
            batch_timeout: None,
        }
    }

    pub fn from_config(gateway: Arc<ActionGateway>, config: &EngineConfig) -> Self {
        let orchestrator = Self::new(gateway).with_concurrency(config.concurrency);
        match config.batch_timeout_ms {
            Some(ms) => orchestrator.with_batch_timeout(Duration::from_millis(ms)),
            None => orchestrator,
        }
    }

    /// Default worker-pool size for batches submitted without their own.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Soft ceiling per batch; units not yet dispatched when it elapses fail
    /// with `BatchTimedOut`. In-flight units are left to finish.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    pub fn gateway(&self) -> &Arc<ActionGateway> {
        &self.gateway
    }

    pub fn tracker(&self) -> OperationProgressTracker {
        OperationProgressTracker::new(self.registry.clone())
    }

    /// Starts a batch with the orchestrator's default concurrency.
    ///
    /// Returns immediately with the operation in `running`. Fails with
    /// `SubmitError::NoRuntime` outside a Tokio runtime.
    pub fn submit(
        &self,
        operation_type: OperationType,
        target_ids: Vec<EntityId>,
        payload: Value,
    ) -> Result<BulkOperation, SubmitError> {
        self.submit_with_concurrency(operation_type, target_ids, payload, self.concurrency)
    }

    pub fn submit_with_concurrency(
        &self,
        operation_type: OperationType,
        target_ids: Vec<EntityId>,
        payload: Value,
        concurrency: usize,
    ) -> Result<BulkOperation, SubmitError> {
        validate(&target_ids, concurrency)?;
        let runtime = Handle::try_current().map_err(|_| SubmitError::NoRuntime)?;

        let operation = BulkOperation::new(operation_type, target_ids, payload, concurrency);
        let id = operation.id;
        let cell = Arc::new(OperationCell::new(operation));
        self.registry.insert(id, cell.clone());

        let running = cell.mark_running();
        info!(
            operation.id = %id,
            operation.kind = %running.operation_type,
            total = running.target_ids.len(),
            concurrency,
            "Bulk operation submitted"
        );

        let dispatch = Arc::new(Dispatch {
            gateway: self.gateway.clone(),
            targets: running.target_ids.clone(),
            operation_type: running.operation_type.clone(),
            payload: running.payload.clone(),
            cursor: AtomicUsize::new(0),
            cancel: cell.cancel_token().clone(),
            abort: CancellationToken::new(),
            deadline: self.batch_timeout.map(|timeout| Instant::now() + timeout),
        });

        let span = create_operation_span(
            &id.to_string(),
            running.operation_type.as_str(),
            running.target_ids.len(),
        );
        runtime.spawn(drive(cell, dispatch, concurrency).instrument(span));

        Ok(running)
    }

    /// Requests cancellation. Undispatched units are skipped; in-flight units
    /// finish and are recorded. Repeating the request while running is a no-op.
    pub fn cancel(&self, id: OperationId) -> Result<(), CancelError> {
        let cell = self.registry.get(&id).ok_or(CancelError::UnknownOperation(id))?;
        cell.request_cancel()?;
        info!(operation.id = %id, "Bulk operation cancellation requested");
        Ok(())
    }

    /// Current record of the operation, final once its status is terminal.
    pub fn result(&self, id: OperationId) -> Option<BulkOperation> {
        self.registry.get(&id).map(|cell| cell.snapshot())
    }

    /// All known operations, oldest first.
    pub fn list(&self) -> Vec<BulkOperation> {
        let mut operations: Vec<BulkOperation> = self.registry.all().iter().map(|cell| cell.snapshot()).collect();
        operations.sort_by_key(|operation| operation.created_at);
        operations
    }

    /// Ids of operations that have not reached a terminal status.
    pub fn running(&self) -> Vec<OperationId> {
        self.registry
            .all()
            .iter()
            .map(|cell| cell.snapshot())
            .filter(|operation| !operation.is_terminal())
            .map(|operation| operation.id)
            .collect()
    }

    /// Forgets a finished operation and returns its final record.
    pub fn remove(&self, id: OperationId) -> Result<BulkOperation, RemoveError> {
        let cell = self.registry.get(&id).ok_or(RemoveError::UnknownOperation(id))?;
        let operation = cell.snapshot();
        if !operation.is_terminal() {
            return Err(RemoveError::StillRunning(id));
        }
        self.registry.remove(&id);
        Ok(operation)
    }
}

fn validate(target_ids: &[EntityId], concurrency: usize) -> Result<(), SubmitError> {
    if target_ids.is_empty() {
        return Err(SubmitError::EmptyBatch);
    }
    if concurrency == 0 {
        return Err(SubmitError::InvalidConcurrency);
    }
    let mut seen = HashSet::with_capacity(target_ids.len());
    for id in target_ids {
        if !seen.insert(id) {
            return Err(SubmitError::DuplicateTarget { id: id.clone() });
        }
    }
    Ok(())
}

/// Records `BatchTimedOut` for every unclaimed target as soon as the batch
/// ceiling elapses, without waiting for in-flight units.
fn expire_undispatched(cell: &OperationCell, dispatch: &Dispatch) {
    if dispatch.cancel.is_cancelled() || dispatch.abort.is_cancelled() {
        return;
    }
    let skipped = dispatch.close();
    if skipped.is_empty() {
        return;
    }
    warn!(skipped = skipped.len(), "Batch ceiling elapsed, expiring undispatched units");
    for target in skipped {
        cell.record(target.clone(), OperationResult::Error { reason: UnitError::BatchTimedOut });
    }
}

async fn drive(cell: Arc<OperationCell>, dispatch: Arc<Dispatch>, concurrency: usize) {
    let timer = OperationTimer::new("bulk_operation");
    let workers = concurrency.min(dispatch.targets.len());
    let (results, mut outcomes) = mpsc::channel::<(EntityId, OperationResult)>(workers.max(1) * 2);

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let dispatch = dispatch.clone();
        let results = results.clone();
        pool.spawn(
            async move {
                while let Some(target) = dispatch.next_target() {
                    debug!(worker, entity.id = %target, "Dispatching unit");
                    let result = dispatch.run_unit(target).await;
                    if results.send((target.clone(), result)).await.is_err() {
                        break;
                    }
                }
            }
            .in_current_span(),
        );
    }
    drop(results);

    let expiry = sleep_until(dispatch.deadline.unwrap_or_else(Instant::now));
    tokio::pin!(expiry);
    let mut awaiting_deadline = dispatch.deadline.is_some();

    loop {
        tokio::select! {
            received = outcomes.recv() => match received {
                Some((target, result)) => {
                    if !cell.record(target.clone(), result) {
                        warn!(entity.id = %target, "Duplicate unit outcome ignored");
                    }
                }
                None => break,
            },
            _ = &mut expiry, if awaiting_deadline => {
                awaiting_deadline = false;
                expire_undispatched(&cell, &dispatch);
            }
        }
    }

    while let Some(joined) = pool.join_next().await {
        if let Err(join_error) = joined {
            error!(error = %join_error, "Bulk worker terminated abnormally");
        }
    }

    let aborted = dispatch.abort.is_cancelled();
    let timed_out = dispatch.deadline_passed();
    let remaining = cell.snapshot().unprocessed_target_ids();
    if !dispatch.cancel.is_cancelled() && !remaining.is_empty() {
        let reason = if timed_out && !aborted {
            UnitError::BatchTimedOut
        } else {
            UnitError::Aborted
        };
        warn!(skipped = remaining.len(), reason = %reason, "Recording undispatched units");
        for target in remaining {
            cell.record(target, OperationResult::Error { reason: reason.clone() });
        }
    }

    let finished = cell.finish(|operation| {
        if operation.cancel_requested {
            BulkStatus::Cancelled
        } else if aborted || operation.progress.success_count == 0 {
            BulkStatus::Failed
        } else {
            BulkStatus::Completed
        }
    });

    let duration_ms = timer.finish();
    info!(
        status = %finished.status,
        succeeded = finished.progress.success_count,
        failed = finished.progress.error_count,
        completed = finished.progress.completed_count,
        duration_ms = duration_ms as u64,
        "Bulk operation finished"
    );
}
