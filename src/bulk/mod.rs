//! Bulk administrative operations over many entities.

pub mod orchestrator;
pub mod progress;
mod registry;
pub mod types;

pub use orchestrator::BulkOperationOrchestrator;
pub use progress::{OperationProgressTracker, ProgressCallback, ProgressEvent, ProgressView, SubscriptionId, TrackerError};
pub use types::{
    BulkOperation, BulkStatus, CancelError, OperationId, OperationProgress, OperationResult, OperationType,
    RemoveError, SubmitError, UnitError,
};
