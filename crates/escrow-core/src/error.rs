use crate::types::{ActionKind, MilestoneStatus};
use thiserror::Error;

/// Milestone escrow errors.
///
/// `Display` output is the user-facing message; `code()` is the stable identifier
/// surfaced by API layers.
#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("milestone totals must equal contract budget: expected {expected}, allocated {actual}")]
    Allocation { expected: u64, actual: u64 },

    #[error("milestone '{milestone_id}' is {status} and can no longer be edited")]
    InvalidState {
        milestone_id: String,
        status: MilestoneStatus,
    },

    #[error("action '{action}' is not available while the milestone is {from}")]
    InvalidTransition {
        from: MilestoneStatus,
        action: ActionKind,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Payment processor '{processor}' failed to release funds: {message}")]
    ExternalTransfer { processor: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent update on {0}; reload and retry")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EscrowError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Allocation { .. } => "allocation_error",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation_error",
            Self::ExternalTransfer { .. } => "external_transfer_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    pub fn invalid_transition(from: MilestoneStatus, action: ActionKind) -> Self {
        Self::InvalidTransition { from, action }
    }

    pub fn milestone_not_found(milestone_id: &str) -> Self {
        Self::NotFound(format!("milestone '{}'", milestone_id))
    }

    pub fn escrow_not_found(escrow_id: &str) -> Self {
        Self::NotFound(format!("escrow '{}'", escrow_id))
    }

    pub fn milestone_conflict(milestone_id: &str) -> Self {
        Self::Conflict(format!("milestone '{}'", milestone_id))
    }

    pub fn escrow_conflict(escrow_id: &str) -> Self {
        Self::Conflict(format!("escrow '{}'", escrow_id))
    }
}
