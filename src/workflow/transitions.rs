use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use super::entity::{Entity, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionName {
    Approve,
    MarkPaid,
    #[serde(alias = "markDeliver")]
    MarkDelivered,
    Complete,
}

impl TransitionName {
    pub const ALL: [TransitionName; 4] = [
        TransitionName::Approve,
        TransitionName::MarkPaid,
        TransitionName::MarkDelivered,
        TransitionName::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransitionName::Approve => "approve",
            TransitionName::MarkPaid => "markPaid",
            TransitionName::MarkDelivered => "markDelivered",
            TransitionName::Complete => "complete",
        }
    }
}

impl fmt::Display for TransitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransitionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(TransitionName::Approve),
            "markPaid" | "mark-paid" => Ok(TransitionName::MarkPaid),
            "markDelivered" | "markDeliver" | "mark-delivered" => Ok(TransitionName::MarkDelivered),
            "complete" => Ok(TransitionName::Complete),
            other => Err(format!("unknown transition '{other}'")),
        }
    }
}

/// A flag or timestamp a transition can set. Flags are never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Flag {
    Approved,
    Paid,
    Delivered,
    Completed,
}

impl Flag {
    pub fn is_set(self, entity: &Entity) -> bool {
        match self {
            Flag::Approved => entity.approved_at.is_some(),
            Flag::Paid => entity.is_paid,
            Flag::Delivered => entity.is_delivered,
            Flag::Completed => entity.completed_at.is_some(),
        }
    }

    fn set(self, entity: &mut Entity, now: DateTime<Utc>) {
        match self {
            Flag::Approved => {
                entity.approved_at.get_or_insert(now);
            }
            Flag::Paid => {
                entity.is_paid = true;
                entity.payment_confirmed_at.get_or_insert(now);
            }
            Flag::Delivered => {
                entity.is_delivered = true;
                entity.delivery_confirmed_at.get_or_insert(now);
            }
            Flag::Completed => {
                entity.completed_at.get_or_insert(now);
            }
        }
    }
}

/// A named, guarded edge of the workflow graph.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkflowTransition {
    pub name: TransitionName,
    pub from: &'static [WorkflowStatus],
    pub to: WorkflowStatus,
    /// Flags that must already be set on the source entity.
    pub requires: &'static [Flag],
    /// Flags the transition sets (the side effect).
    pub sets: &'static [Flag],
}

pub static TRANSITIONS: [WorkflowTransition; 4] = [
    WorkflowTransition {
        name: TransitionName::Approve,
        from: &[WorkflowStatus::Pending],
        to: WorkflowStatus::Approved,
        requires: &[],
        sets: &[Flag::Approved],
    },
    WorkflowTransition {
        name: TransitionName::MarkPaid,
        from: &[WorkflowStatus::Approved],
        to: WorkflowStatus::Approved,
        requires: &[],
        sets: &[Flag::Paid],
    },
    WorkflowTransition {
        name: TransitionName::MarkDelivered,
        from: &[WorkflowStatus::Approved],
        to: WorkflowStatus::Approved,
        requires: &[Flag::Paid],
        sets: &[Flag::Delivered],
    },
    WorkflowTransition {
        name: TransitionName::Complete,
        from: &[WorkflowStatus::Approved],
        to: WorkflowStatus::Completed,
        requires: &[],
        sets: &[Flag::Paid, Flag::Delivered, Flag::Completed],
    },
];

impl WorkflowTransition {
    pub fn lookup(name: TransitionName) -> &'static WorkflowTransition {
        // The table holds exactly one edge per name, in declaration order.
        &TRANSITIONS[name as usize]
    }

    /// The guard shared by `transition` and `available_transitions`.
    ///
    /// An edge that would neither change the status nor set a new flag is not
    /// offered, so `markPaid` disappears once the entity is paid.
    pub fn permits(&self, entity: &Entity) -> bool {
        self.from.contains(&entity.workflow_status)
            && self.requires.iter().all(|flag| flag.is_set(entity))
            && (self.to != entity.workflow_status || self.sets.iter().any(|flag| !flag.is_set(entity)))
    }

    /// Computes the candidate entity. Callers check `permits` first.
    pub fn apply(&self, entity: &Entity, now: DateTime<Utc>) -> Entity {
        let mut candidate = entity.clone();
        candidate.workflow_status = self.to;
        for flag in self.sets {
            flag.set(&mut candidate, now);
        }
        candidate
    }

    /// The patch sent to the remote store for this transition.
    pub fn patch(&self, candidate: &Entity) -> serde_json::Value {
        json!({
            "transition": self.name,
            "workflowStatus": candidate.workflow_status,
            "isPaid": candidate.is_paid,
            "isDelivered": candidate.is_delivered,
            "approvedAt": candidate.approved_at,
            "paymentConfirmedAt": candidate.payment_confirmed_at,
            "deliveryConfirmedAt": candidate.delivery_confirmed_at,
            "completedAt": candidate.completed_at,
        })
    }
}
