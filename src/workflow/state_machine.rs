use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn, Instrument};

use super::entity::{Entity, WorkflowStatus};
use super::snapshot::SnapshotPair;
use super::transitions::{TransitionName, WorkflowTransition, TRANSITIONS};
use crate::gateway::{ActionGateway, GatewayError, GatewayRequest, MutationKind};
use crate::telemetry::{create_transition_span, generate_correlation_id};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPhase {
    /// Candidate shown before the store confirmed it.
    Optimistic,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityEvent {
    pub phase: EntityPhase,
    pub transition: TransitionName,
    pub entity: Entity,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Transition '{transition}' is not allowed from status '{status}'")]
    InvalidTransition {
        transition: TransitionName,
        status: WorkflowStatus,
    },

    /// The store call failed; `restored` is the last confirmed entity.
    #[error("Transition '{transition}' rolled back: {source}")]
    Remote {
        transition: TransitionName,
        source: GatewayError,
        restored: Box<Entity>,
    },
}

impl TransitionError {
    pub fn reason(&self) -> &'static str {
        match self {
            TransitionError::InvalidTransition { .. } => "invalid_transition",
            TransitionError::Remote { source, .. } => source.reason(),
        }
    }

    /// The entity the caller should display after the failure.
    pub fn restored(&self) -> Option<&Entity> {
        match self {
            TransitionError::Remote { restored, .. } => Some(restored.as_ref()),
            TransitionError::InvalidTransition { .. } => None,
        }
    }
}

/// Transitions a caller may offer for `entity`. Uses the same guard as
/// `WorkflowStateMachine::transition`.
pub fn available_transitions(entity: &Entity) -> BTreeSet<TransitionName> {
    TRANSITIONS
        .iter()
        .filter(|edge| edge.permits(entity))
        .map(|edge| edge.name)
        .collect()
}

type Settlement<'a> = Pin<Box<dyn Future<Output = Result<Entity, TransitionError>> + Send + 'a>>;

/// A transition whose optimistic value is known but whose store call has not
/// been awaited yet.
pub struct PendingTransition<'a> {
    pub optimistic: Entity,
    settlement: Settlement<'a>,
}

impl<'a> PendingTransition<'a> {
    /// Issues the store call and resolves to the confirmed or restored entity.
    pub async fn settle(self) -> Result<Entity, TransitionError> {
        self.settlement.await
    }
}

/// Applies workflow transitions to single entities, optimistically.
///
/// Exactly one gateway call is made per transition. Failures are not retried
/// here; the gateway's retry policy is the only retry layer.
pub struct WorkflowStateMachine {
    gateway: Arc<ActionGateway>,
    events: broadcast::Sender<EntityEvent>,
    timeout: Option<Duration>,
}

impl WorkflowStateMachine {
    pub fn new(gateway: Arc<ActionGateway>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gateway,
            events,
            timeout: None,
        }
    }

    /// Per-call timeout; falls back to the gateway default when unset.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.events.subscribe()
    }

    pub fn available_transitions(&self, entity: &Entity) -> BTreeSet<TransitionName> {
        available_transitions(entity)
    }

    pub async fn transition(&self, entity: &Entity, name: TransitionName) -> Result<Entity, TransitionError> {
        self.begin(entity, name)?.settle().await
    }

    /// Validates the edge, computes the candidate and publishes it as
    /// `Optimistic`. The store call happens when the result is settled.
    pub fn begin(&self, entity: &Entity, name: TransitionName) -> Result<PendingTransition<'_>, TransitionError> {
        let edge = WorkflowTransition::lookup(name);
        if !edge.permits(entity) {
            return Err(TransitionError::InvalidTransition {
                transition: name,
                status: entity.workflow_status,
            });
        }

        let mut snapshots = SnapshotPair::new(entity.clone());
        let optimistic = snapshots.stage(edge.apply(entity, Utc::now())).clone();
        self.publish(EntityPhase::Optimistic, name, &optimistic);

        let correlation_id = generate_correlation_id();
        let span = create_transition_span(name.as_str(), entity.id.as_str(), &correlation_id);
        let settlement = self.confirm(snapshots, edge, optimistic.clone()).instrument(span);

        Ok(PendingTransition {
            optimistic,
            settlement: Box::pin(settlement),
        })
    }

    async fn confirm(
        &self,
        mut snapshots: SnapshotPair,
        edge: &'static WorkflowTransition,
        candidate: Entity,
    ) -> Result<Entity, TransitionError> {
        let mut request = GatewayRequest::new(candidate.id.clone(), MutationKind::Update, edge.patch(&candidate));
        if let Some(timeout) = self.timeout {
            request = request.with_timeout(timeout);
        }

        match self.gateway.invoke(request).await {
            Ok(_) => {
                let confirmed = snapshots.commit().clone();
                info!(
                    entity.id = %confirmed.id,
                    status = %confirmed.workflow_status,
                    "Transition confirmed"
                );
                self.publish(EntityPhase::Confirmed, edge.name, &confirmed);
                Ok(snapshots.into_confirmed())
            }
            Err(source) => {
                let restored = snapshots.rollback().clone();
                warn!(
                    entity.id = %restored.id,
                    reason = source.reason(),
                    "Transition rolled back"
                );
                self.publish(EntityPhase::RolledBack, edge.name, &restored);
                Err(TransitionError::Remote {
                    transition: edge.name,
                    source,
                    restored: Box::new(restored),
                })
            }
        }
    }

    fn publish(&self, phase: EntityPhase, transition: TransitionName, entity: &Entity) {
        // No receivers is fine; presentation layers subscribe optionally.
        let _ = self.events.send(EntityEvent {
            phase,
            transition,
            entity: entity.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InMemoryStore, StoreFailure};

    fn machine_with(store: Arc<InMemoryStore>) -> WorkflowStateMachine {
        WorkflowStateMachine::new(Arc::new(ActionGateway::new(store)))
    }

    #[tokio::test]
    async fn test_approve_confirms_and_sets_timestamp() {
        let store = Arc::new(InMemoryStore::new().with_records(["b-1"]));
        let machine = machine_with(store.clone());
        let entity = Entity::pending("b-1");

        let approved = machine.transition(&entity, TransitionName::Approve).await.unwrap();

        assert_eq!(approved.workflow_status, WorkflowStatus::Approved);
        assert!(approved.approved_at.is_some());
        assert_eq!(store.record(&"b-1".into()).unwrap()["workflowStatus"], "approved");
    }

    #[tokio::test]
    async fn test_invalid_transition_makes_no_call() {
        let store = Arc::new(InMemoryStore::new().with_records(["b-1"]));
        let machine = machine_with(store.clone());

        let error = machine
            .transition(&Entity::pending("b-1"), TransitionName::MarkPaid)
            .await
            .unwrap_err();

        assert!(matches!(error, TransitionError::InvalidTransition { .. }));
        assert!(error.restored().is_none());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_events_show_optimistic_then_rollback() {
        let store = Arc::new(InMemoryStore::new().with_records(["b-1"]));
        store.fail_next("b-1", StoreFailure::Reject { code: 403, message: "locked".into() });
        let machine = machine_with(store);
        let mut events = machine.subscribe();
        let entity = Entity::pending("b-1");

        let error = machine.transition(&entity, TransitionName::Approve).await.unwrap_err();
        assert_eq!(error.reason(), "rejected");
        assert_eq!(error.restored(), Some(&entity));

        let first = events.recv().await.unwrap();
        assert_eq!(first.phase, EntityPhase::Optimistic);
        assert_eq!(first.entity.workflow_status, WorkflowStatus::Approved);

        let second = events.recv().await.unwrap();
        assert_eq!(second.phase, EntityPhase::RolledBack);
        assert_eq!(second.entity, entity);
    }

    #[tokio::test]
    async fn test_begin_exposes_candidate_before_call() {
        let store = Arc::new(InMemoryStore::new().with_records(["b-1"]));
        let machine = machine_with(store.clone());

        let pending = machine.begin(&Entity::pending("b-1"), TransitionName::Approve).unwrap();
        assert_eq!(pending.optimistic.workflow_status, WorkflowStatus::Approved);
        assert!(store.calls().is_empty());

        let confirmed = pending.settle().await.unwrap();
        assert_eq!(store.calls().len(), 1);
        assert_eq!(confirmed.workflow_status, WorkflowStatus::Approved);
    }

    #[test]
    fn test_available_transitions_for_pending() {
        let available = available_transitions(&Entity::pending("b-1"));
        assert_eq!(available.into_iter().collect::<Vec<_>>(), vec![TransitionName::Approve]);
    }
}
