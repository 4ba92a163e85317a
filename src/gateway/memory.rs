//! In-process reference store used by the CLI and the test suites.
//!
//! Failures and latency can be scripted per entity so the orchestration
//! paths can be exercised without a hosted database.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::store::{Mutation, MutationKind, RemoteStore, StoreAck, StoreError};
use crate::workflow::EntityId;

/// Failure injected into `InMemoryStore::apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreFailure {
    Reject { code: u16, message: String },
    Unavailable(String),
    Misconfigured(String),
    /// Never answers; only a gateway timeout or cancellation ends the call.
    Hang,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<EntityId, Value>,
    /// Consumed one per call before `sticky` is consulted.
    queued: HashMap<EntityId, VecDeque<StoreFailure>>,
    sticky: HashMap<EntityId, StoreFailure>,
    latency: HashMap<EntityId, Duration>,
    calls: Vec<(EntityId, MutationKind)>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    default_latency: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Seeds records with an empty JSON object each.
    pub fn with_records<I, T>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityId>,
    {
        {
            let mut inner = self.lock();
            for id in ids {
                inner.records.insert(id.into(), Value::Object(Default::default()));
            }
        }
        self
    }

    pub fn insert_record(&self, id: impl Into<EntityId>, record: Value) {
        self.lock().records.insert(id.into(), record);
    }

    pub fn record(&self, id: &EntityId) -> Option<Value> {
        self.lock().records.get(id).cloned()
    }

    /// Every call for `id` fails with `failure` until cleared.
    pub fn fail_always(&self, id: impl Into<EntityId>, failure: StoreFailure) {
        self.lock().sticky.insert(id.into(), failure);
    }

    /// The next call for `id` fails with `failure`.
    pub fn fail_next(&self, id: impl Into<EntityId>, failure: StoreFailure) {
        self.lock().queued.entry(id.into()).or_default().push_back(failure);
    }

    pub fn clear_failures(&self, id: &EntityId) {
        let mut inner = self.lock();
        inner.sticky.remove(id);
        inner.queued.remove(id);
    }

    pub fn set_latency(&self, id: impl Into<EntityId>, latency: Duration) {
        self.lock().latency.insert(id.into(), latency);
    }

    /// Calls in the order they reached the store.
    pub fn calls(&self) -> Vec<(EntityId, MutationKind)> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, id: &EntityId) -> usize {
        self.lock().calls.iter().filter(|(called, _)| called == id).count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_to_records(inner: &mut Inner, entity_id: &EntityId, mutation: &Mutation) -> Result<StoreAck, StoreError> {
        let record = match mutation.kind {
            MutationKind::Create => {
                if inner.records.contains_key(entity_id) {
                    return Err(StoreError::Rejected {
                        code: 409,
                        message: format!("record {entity_id} already exists"),
                    });
                }
                inner.records.insert(entity_id.clone(), mutation.patch.clone());
                Some(mutation.patch.clone())
            }
            MutationKind::Update => {
                let record = inner
                    .records
                    .get_mut(entity_id)
                    .ok_or_else(|| StoreError::NotFound(entity_id.clone()))?;
                merge(record, &mutation.patch);
                Some(record.clone())
            }
            MutationKind::Delete => {
                inner
                    .records
                    .remove(entity_id)
                    .ok_or_else(|| StoreError::NotFound(entity_id.clone()))?;
                None
            }
            MutationKind::FetchStatus => Some(
                inner
                    .records
                    .get(entity_id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(entity_id.clone()))?,
            ),
        };

        Ok(StoreAck {
            entity_id: entity_id.clone(),
            record,
        })
    }
}

fn merge(record: &mut Value, patch: &Value) {
    match (record, patch) {
        (Value::Object(target), Value::Object(changes)) => {
            for (key, value) in changes {
                target.insert(key.clone(), value.clone());
            }
        }
        (target, replacement) => *target = replacement.clone(),
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn apply(&self, entity_id: &EntityId, mutation: &Mutation) -> Result<StoreAck, StoreError> {
        let (failure, latency) = {
            let mut inner = self.lock();
            inner.calls.push((entity_id.clone(), mutation.kind));
            let queued = inner.queued.get_mut(entity_id).and_then(VecDeque::pop_front);
            let failure = queued.or_else(|| inner.sticky.get(entity_id).cloned());
            let latency = inner.latency.get(entity_id).copied().unwrap_or(self.default_latency);
            (failure, latency)
        };

        debug!(entity.id = %entity_id, kind = ?mutation.kind, "In-memory store call");

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let Some(failure) = failure else {
            let mut inner = self.lock();
            return Self::apply_to_records(&mut inner, entity_id, mutation);
        };

        match failure {
            StoreFailure::Hang => std::future::pending().await,
            StoreFailure::Reject { code, message } => Err(StoreError::Rejected { code, message }),
            StoreFailure::Unavailable(message) => Err(StoreError::Unavailable(message)),
            StoreFailure::Misconfigured(message) => Err(StoreError::Misconfigured(message)),
        }
    }
}
