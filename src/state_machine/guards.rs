use async_trait::async_trait;

use super::errors::{business_rule_violation, GuardResult};
use crate::models::WorkflowExecution;

/// Trait for implementing state transition guards
#[async_trait]
pub trait StateGuard<T>: Send + Sync {
    /// Check if a transition is allowed
    async fn check(&self, entity: &T) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Leaving PREPARING for QUEUED requires every parameterized source to be resolved
pub struct ArtifactsResolvedGuard;

#[async_trait]
impl StateGuard<WorkflowExecution> for ArtifactsResolvedGuard {
    async fn check(&self, execution: &WorkflowExecution) -> GuardResult<()> {
        if execution.args.needs_preparation() {
            return Err(business_rule_violation(format!(
                "Execution {} still has {} unresolved artifact variables",
                execution.uuid,
                execution.args.artifact_variables.len()
            )));
        }
        Ok(())
    }

    fn description(&self) -> &'static str {
        "All artifact variables must be resolved"
    }
}

/// A rejected execution must record why it was rejected
pub struct RejectionReasonGuard;

#[async_trait]
impl StateGuard<WorkflowExecution> for RejectionReasonGuard {
    async fn check(&self, execution: &WorkflowExecution) -> GuardResult<()> {
        match execution.rejection_reason.as_deref() {
            Some(reason) if !reason.trim().is_empty() => Ok(()),
            _ => Err(business_rule_violation(format!(
                "Execution {} cannot be rejected without a reason",
                execution.uuid
            ))),
        }
    }

    fn description(&self) -> &'static str {
        "Rejections must carry a reason"
    }
}
