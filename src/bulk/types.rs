use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::gateway::{GatewayError, MutationKind};
use crate::workflow::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Administrative action applied to every target of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Renew,
    Suspend,
    Delete,
    Custom(String),
}

impl OperationType {
    pub fn mutation_kind(&self) -> MutationKind {
        match self {
            OperationType::Create => MutationKind::Create,
            OperationType::Renew | OperationType::Suspend | OperationType::Custom(_) => MutationKind::Update,
            OperationType::Delete => MutationKind::Delete,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Create => "create",
            OperationType::Renew => "renew",
            OperationType::Suspend => "suspend",
            OperationType::Delete => "delete",
            OperationType::Custom(name) => name,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("operation type must not be empty".to_string()),
            "create" => Ok(OperationType::Create),
            "renew" => Ok(OperationType::Renew),
            "suspend" => Ok(OperationType::Suspend),
            "delete" => Ok(OperationType::Delete),
            other => Ok(OperationType::Custom(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BulkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BulkStatus::Completed | BulkStatus::Failed | BulkStatus::Cancelled)
    }
}

impl fmt::Display for BulkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BulkStatus::Pending => "pending",
            BulkStatus::Running => "running",
            BulkStatus::Completed => "completed",
            BulkStatus::Failed => "failed",
            BulkStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Why a single unit of a batch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("network failure: {message}")]
    NetworkFailure { message: String },
    #[error("not found")]
    NotFound,
    #[error("gateway misconfigured: {reason}")]
    Misconfigured { reason: String },
    /// Never dispatched: the whole-batch ceiling elapsed first.
    #[error("batch timed out before dispatch")]
    BatchTimedOut,
    /// Never dispatched: another unit hit an unrecoverable gateway error.
    #[error("batch aborted before dispatch")]
    Aborted,
}

impl From<GatewayError> for UnitError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Timeout { after_ms } => UnitError::Timeout { after_ms },
            GatewayError::Rejected { code, message } => UnitError::Rejected { code, message },
            GatewayError::NetworkFailure { message } => UnitError::NetworkFailure { message },
            GatewayError::NotFound { .. } => UnitError::NotFound,
            GatewayError::Misconfigured { reason } => UnitError::Misconfigured { reason },
            // Workers call the gateway without a cancel token, so a cancelled
            // call can only come from a batch that stopped dispatching.
            GatewayError::Cancelled => UnitError::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    Error { reason: UnitError },
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success)
    }
}

/// Live counters of one batch.
///
/// `completed_count == success_count + error_count <= total` always holds;
/// counts only grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgress {
    pub total: usize,
    pub completed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub results: BTreeMap<EntityId, OperationResult>,
}

impl OperationProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Records the outcome of one unit. Returns false if the unit already had one.
    pub(crate) fn record(&mut self, target: EntityId, result: OperationResult) -> bool {
        if self.results.contains_key(&target) || self.completed_count >= self.total {
            return false;
        }
        if result.is_success() {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.completed_count += 1;
        self.results.insert(target, result);
        true
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed_count as f64 * 100.0 / self.total as f64
    }

    pub fn is_consistent(&self) -> bool {
        self.completed_count == self.success_count + self.error_count
            && self.completed_count <= self.total
            && self.results.len() == self.completed_count
    }
}

/// One administrative batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperation {
    pub id: OperationId,
    pub operation_type: OperationType,
    pub target_ids: Vec<EntityId>,
    pub payload: serde_json::Value,
    pub status: BulkStatus,
    /// Set once `cancel` was accepted; the status flips to `cancelled` after
    /// in-flight units drain.
    pub cancel_requested: bool,
    pub concurrency: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: OperationProgress,
}

impl BulkOperation {
    pub(crate) fn new(
        operation_type: OperationType,
        target_ids: Vec<EntityId>,
        payload: serde_json::Value,
        concurrency: usize,
    ) -> Self {
        let total = target_ids.len();
        Self {
            id: OperationId::new(),
            operation_type,
            target_ids,
            payload,
            status: BulkStatus::Pending,
            cancel_requested: false,
            concurrency,
            created_at: Utc::now(),
            completed_at: None,
            progress: OperationProgress::new(total),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Targets whose unit failed, in input order. The subset a caller would resubmit.
    pub fn failed_target_ids(&self) -> Vec<EntityId> {
        self.target_ids
            .iter()
            .filter(|id| matches!(self.progress.results.get(id), Some(OperationResult::Error { .. })))
            .cloned()
            .collect()
    }

    /// Targets that never got an outcome (only possible after cancellation).
    pub fn unprocessed_target_ids(&self) -> Vec<EntityId> {
        self.target_ids
            .iter()
            .filter(|id| !self.progress.results.contains_key(id))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("A bulk operation needs at least one target")]
    EmptyBatch,
    #[error("Target {id} appears more than once")]
    DuplicateTarget { id: EntityId },
    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("Bulk operations must be submitted from within a Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("Operation {id} is {status} and can no longer be cancelled")]
    NotCancellable { id: OperationId, status: BulkStatus },
    #[error("Unknown operation {0}")]
    UnknownOperation(OperationId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoveError {
    #[error("Operation {0} is still running")]
    StillRunning(OperationId),
    #[error("Unknown operation {0}")]
    UnknownOperation(OperationId),
}
