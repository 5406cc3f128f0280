use thiserror::Error;
use uuid::Uuid;

use super::states::ExecutionStatus;
use crate::errors::StoreError;

/// Error types for execution status transitions
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: ExecutionStatus, event: String },

    #[error("Execution {execution_uuid} is already in final status {status}")]
    AlreadyFinal {
        execution_uuid: Uuid,
        status: ExecutionStatus,
    },

    #[error("Execution {0} not found while persisting transition")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specific error type for guard condition failures
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Store(store) => Self::Store(store),
            other => Self::GuardFailed {
                reason: other.to_string(),
            },
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

pub(crate) fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}
