// Per-operation shared state.
// The aggregator task of each batch is the only writer of its `state`;
// readers go through the watch channel. Locks here never span an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::progress::{ProgressCallback, ProgressEvent, ProgressView, SubscriptionId};
use super::types::{BulkOperation, BulkStatus, CancelError, OperationId, OperationResult};
use crate::workflow::EntityId;

pub(crate) struct OperationCell {
    state: watch::Sender<BulkOperation>,
    cancel: CancellationToken,
    subscribers: Mutex<Vec<(SubscriptionId, ProgressCallback)>>,
}

impl OperationCell {
    pub(crate) fn new(operation: BulkOperation) -> Self {
        let (state, _) = watch::channel(operation);
        Self {
            state,
            cancel: CancellationToken::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> BulkOperation {
        self.state.borrow().clone()
    }

    pub(crate) fn view(&self) -> ProgressView {
        ProgressView::from(&*self.state.borrow())
    }

    pub(crate) fn watch(&self) -> watch::Receiver<BulkOperation> {
        self.state.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, ProgressCallback)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_running(&self) -> BulkOperation {
        self.state.send_modify(|operation| {
            if operation.status == BulkStatus::Pending {
                operation.status = BulkStatus::Running;
            }
        });
        self.snapshot()
    }

    /// Records one unit outcome and notifies subscribers once.
    /// Returns false when the target already had an outcome.
    pub(crate) fn record(&self, target: EntityId, result: OperationResult) -> bool {
        let subscribers = self.lock_subscribers();
        let recorded = self.state.send_if_modified(|operation| {
            !operation.is_terminal() && operation.progress.record(target.clone(), result.clone())
        });
        if !recorded {
            return false;
        }

        let event = ProgressEvent {
            view: self.view(),
            unit: Some((target, result)),
        };
        let callbacks: Vec<ProgressCallback> = subscribers.iter().map(|(_, callback)| callback.clone()).collect();
        drop(subscribers);

        for callback in callbacks {
            callback(&event);
        }
        true
    }

    /// Moves the operation to its terminal status. The status is decided under
    /// the same lock `request_cancel` uses, so an accepted cancel is never lost.
    pub(crate) fn finish(&self, decide: impl FnOnce(&BulkOperation) -> BulkStatus) -> BulkOperation {
        let subscribers = self.lock_subscribers();
        let finished = self.state.send_if_modified(|operation| {
            if operation.is_terminal() {
                return false;
            }
            operation.status = decide(operation);
            operation.completed_at = Some(chrono::Utc::now());
            true
        });

        let snapshot = self.snapshot();
        let callbacks: Vec<ProgressCallback> = if finished {
            subscribers.iter().map(|(_, callback)| callback.clone()).collect()
        } else {
            Vec::new()
        };
        drop(subscribers);

        let event = ProgressEvent {
            view: ProgressView::from(&snapshot),
            unit: None,
        };
        for callback in callbacks {
            callback(&event);
        }
        snapshot
    }

    /// Accepted only while some unit still lacks an outcome. Once every unit
    /// is recorded the batch is settling and keeps its real status.
    pub(crate) fn request_cancel(&self) -> Result<(), CancelError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|operation| {
            let settled = operation.progress.completed_count >= operation.progress.total;
            if operation.is_terminal() || settled {
                outcome = Err(CancelError::NotCancellable {
                    id: operation.id,
                    status: operation.status,
                });
                return false;
            }
            if operation.cancel_requested {
                return false;
            }
            operation.cancel_requested = true;
            true
        });

        if outcome.is_ok() {
            self.cancel.cancel();
        }
        outcome
    }

    /// Registers `callback` for future events. If the operation is already
    /// terminal the callback fires once, immediately, with the final view and
    /// is not kept.
    pub(crate) fn subscribe(&self, id: SubscriptionId, callback: ProgressCallback) {
        let mut subscribers = self.lock_subscribers();
        let view = self.view();
        if view.status.is_terminal() {
            drop(subscribers);
            callback(&ProgressEvent { view, unit: None });
            return;
        }
        subscribers.push((id, callback));
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }
}

/// Every operation known to one orchestrator, shared with its trackers.
#[derive(Default)]
pub(crate) struct OperationRegistry {
    cells: RwLock<HashMap<OperationId, Arc<OperationCell>>>,
}

impl OperationRegistry {
    pub(crate) fn insert(&self, id: OperationId, cell: Arc<OperationCell>) {
        self.cells.write().unwrap_or_else(PoisonError::into_inner).insert(id, cell);
    }

    pub(crate) fn get(&self, id: &OperationId) -> Option<Arc<OperationCell>> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    pub(crate) fn remove(&self, id: &OperationId) -> Option<Arc<OperationCell>> {
        self.cells.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    pub(crate) fn all(&self) -> Vec<Arc<OperationCell>> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
