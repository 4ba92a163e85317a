use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a budget or license record in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Approved,
    Completed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "approved" => Ok(WorkflowStatus::Approved),
            "completed" => Ok(WorkflowStatus::Completed),
            other => Err(format!("unknown workflow status '{other}'")),
        }
    }
}

/// A record subject to the budget workflow.
///
/// Flags only ever move from unset to set; see `transitions` for the edges
/// that set them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub workflow_status: WorkflowStatus,
    pub is_paid: bool,
    pub is_delivered: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Entity {
    /// A freshly created record in `pending` with no flags set.
    pub fn pending(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            workflow_status: WorkflowStatus::Pending,
            is_paid: false,
            is_delivered: false,
            approved_at: None,
            payment_confirmed_at: None,
            delivery_confirmed_at: None,
            completed_at: None,
        }
    }

    /// Whether the flags agree with the status.
    pub fn is_consistent(&self) -> bool {
        let flags_ok = (!self.is_paid || self.payment_confirmed_at.is_some())
            && (!self.is_delivered || self.delivery_confirmed_at.is_some());

        let status_ok = match self.workflow_status {
            WorkflowStatus::Pending => {
                !self.is_paid && !self.is_delivered && self.approved_at.is_none()
            }
            WorkflowStatus::Approved => self.approved_at.is_some() && self.completed_at.is_none(),
            WorkflowStatus::Completed => {
                self.is_paid && self.is_delivered && self.completed_at.is_some()
            }
        };

        flags_ok && status_ok
    }
}
