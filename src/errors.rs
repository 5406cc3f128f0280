//! Error types for the deployment execution orchestrator.
//!
//! Mutating entry points return [`DeployError`] eagerly; read and refresh paths
//! log and continue, so most callers only see the validation, authorization and
//! policy variants.

use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::StateMachineError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeployError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Account {account_id} has expired")]
    AccountExpired { account_id: String },
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("Deployment freeze in effect: {message}")]
    DeploymentFreeze {
        freeze_window_ids: Vec<String>,
        message: String,
    },
    #[error("Workflow execution {execution_uuid} already completed")]
    AlreadyCompleted { execution_uuid: Uuid },
    #[error("Invalid interrupt: {0}")]
    InvalidInterrupt(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Concurrent modification of {entity}")]
    ConcurrentModification { entity: String },
    #[error("Rollback not possible: {0}")]
    RollbackPrecondition(String),
    #[error("Pipeline {pipeline_id} already has an execution in progress")]
    PipelineAlreadyTriggered { pipeline_id: String },
    #[error("Invalid state transition: {0}")]
    StateTransition(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Collaborator {service} failed: {reason}")]
    Collaborator { service: String, reason: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn collaborator(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Collaborator {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Errors caused by the request rather than by the system
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::Unauthorized(_)
                | Self::AccountExpired { .. }
                | Self::LimitExceeded(_)
                | Self::DeploymentFreeze { .. }
                | Self::InvalidInterrupt(_)
                | Self::Unsupported(_)
                | Self::RollbackPrecondition(_)
                | Self::PipelineAlreadyTriggered { .. }
        )
    }

    /// Expected races that the next read resolves on its own
    pub fn is_benign_race(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::AlreadyCompleted { .. }
        )
    }
}

/// Errors raised by an [`crate::store::ExecutionStore`] implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Concurrent modification detected for {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for DeployError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => DeployError::NotFound(format!("{entity} {id}")),
            StoreError::ConcurrentModification { entity, id } => {
                DeployError::ConcurrentModification {
                    entity: format!("{entity} {id}"),
                }
            }
            other => DeployError::Store(other.to_string()),
        }
    }
}

impl From<StateMachineError> for DeployError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::AlreadyFinal { execution_uuid, .. } => {
                DeployError::AlreadyCompleted { execution_uuid }
            }
            StateMachineError::Store(store) => store.into(),
            other => DeployError::StateTransition(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DeployError {
    fn from(error: serde_json::Error) -> Self {
        DeployError::Validation(format!("JSON serialization error: {error}"))
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflicts_map_to_benign_races() {
        let err: DeployError = StoreError::ConcurrentModification {
            entity: "workflow_execution",
            id: "abc".into(),
        }
        .into();
        assert!(err.is_benign_race());
        assert!(!err.is_user_error());
    }

    #[test]
    fn freeze_is_a_user_error() {
        let err = DeployError::DeploymentFreeze {
            freeze_window_ids: vec!["fw-1".into()],
            message: "holiday".into(),
        };
        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "Deployment freeze in effect: holiday");
    }

    #[test]
    fn already_completed_mentions_the_execution() {
        let id = Uuid::new_v4();
        let err = DeployError::AlreadyCompleted { execution_uuid: id };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(err.is_benign_race());
    }
}
