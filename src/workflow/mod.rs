// Workflow state engine: per-entity status lifecycle applied optimistically
// against the remote store, with rollback on failure.

pub mod entity;
pub mod snapshot;
pub mod state_machine;
pub mod transitions;

pub use entity::{Entity, EntityId, WorkflowStatus};
pub use snapshot::SnapshotPair;
pub use state_machine::{
    available_transitions, EntityEvent, EntityPhase, PendingTransition, TransitionError, WorkflowStateMachine,
};
pub use transitions::{Flag, TransitionName, WorkflowTransition, TRANSITIONS};
