use thiserror::Error;

use crate::workflow::EntityId;

/// Typed outcome of a failed `ActionGateway::invoke`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Remote call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Remote store rejected the request ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Network failure: {message}")]
    NetworkFailure { message: String },

    #[error("Entity not found: {entity_id}")]
    NotFound { entity_id: EntityId },

    /// The gateway or store is misconfigured; retrying other entities is pointless.
    #[error("Gateway misconfigured: {reason}")]
    Misconfigured { reason: String },

    #[error("Remote call cancelled by caller")]
    Cancelled,
}

impl GatewayError {
    /// Short machine-friendly label.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Rejected { .. } => "rejected",
            GatewayError::NetworkFailure { .. } => "network",
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::Misconfigured { .. } => "misconfigured",
            GatewayError::Cancelled => "cancelled",
        }
    }

    /// Only transport failures that certainly did not reach the store are retryable.
    /// A timeout may have been applied remotely, so it is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::NetworkFailure { .. })
    }

    /// Errors that make every further call through the same gateway fail too.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, GatewayError::Misconfigured { .. })
    }
}
