//! Contract with the hosted relational store.
//!
//! The store is reached over request/response calls that may fail or hang;
//! `ActionGateway` is the only caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    FetchStatus,
}

/// One single-entity change sent to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub patch: serde_json::Value,
    /// Generated once per request and reused by gateway retries, so a store
    /// that deduplicates can drop repeats. Nothing in this crate relies on it.
    pub idempotency_key: Uuid,
}

impl Mutation {
    pub fn new(kind: MutationKind, patch: serde_json::Value) -> Self {
        Self {
            kind,
            patch,
            idempotency_key: Uuid::new_v4(),
        }
    }
}

/// Acknowledgement returned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreAck {
    pub entity_id: EntityId,
    /// The record as stored after the call, when the store returns it.
    pub record: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record {0} does not exist")]
    NotFound(EntityId),
    #[error("store rejected request with status {code}: {message}")]
    Rejected { code: u16, message: String },
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store misconfigured: {0}")]
    Misconfigured(String),
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn apply(&self, entity_id: &EntityId, mutation: &Mutation) -> Result<StoreAck, StoreError>;
}
