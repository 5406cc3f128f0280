//! # System Constants
//!
//! Core enums shared by every component of the execution orchestrator: execution
//! kinds, interrupt kinds, state kinds and the deployment types that participate
//! in rollback decisions.

use serde::{Deserialize, Serialize};
use std::fmt;

// Re-export the status vocabulary for convenience
pub use crate::state_machine::ExecutionStatus;

/// Names of the lifecycle events published through the event publisher
pub mod events {
    pub const EXECUTION_TRIGGERED: &str = "execution.triggered";
    pub const EXECUTION_REJECTED: &str = "execution.rejected";
    pub const EXECUTION_STATUS_CHANGED: &str = "execution.status_changed";
    pub const EXECUTION_COMPLETED: &str = "execution.completed";
    pub const INTERRUPT_REGISTERED: &str = "interrupt.registered";
    pub const APPROVAL_DECIDED: &str = "approval.decided";
    pub const ROLLBACK_TRIGGERED: &str = "rollback.triggered";
}

/// Kind of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    /// A single orchestration graph
    Orchestration,
    /// A sequence of (optionally parallel) stages wrapping orchestrations
    Pipeline,
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestration => write!(f, "ORCHESTRATION"),
            Self::Pipeline => write!(f, "PIPELINE"),
        }
    }
}

/// Out-of-band command kinds accepted by the interrupt propagator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionInterruptType {
    Pause,
    Resume,
    PauseAll,
    ResumeAll,
    AbortAll,
    Rollback,
    RollbackProvisionerAfterPhases,
}

impl ExecutionInterruptType {
    /// Interrupts that may be raised against a pipeline execution
    pub fn is_pipeline_level(&self) -> bool {
        matches!(self, Self::PauseAll | Self::ResumeAll | Self::AbortAll)
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Self::Pause | Self::PauseAll)
    }
}

impl fmt::Display for ExecutionInterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::PauseAll => "PAUSE_ALL",
            Self::ResumeAll => "RESUME_ALL",
            Self::AbortAll => "ABORT_ALL",
            Self::Rollback => "ROLLBACK",
            Self::RollbackProvisionerAfterPhases => "ROLLBACK_PROVISIONER_AFTER_PHASES",
        };
        f.write_str(name)
    }
}

/// Kind of an executed state node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Approval,
    EnvState,
    EnvLoopState,
    EnvRollbackState,
    Fork,
    Repeat,
    Phase,
    PhaseStep,
    Step,
    ResourceConstraint,
    Barrier,
}

/// Kind of a declared pipeline stage element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageElementType {
    EnvState,
    EnvLoopState,
    EnvRollbackState,
    Approval,
    /// Stage kinds this orchestrator does not understand; rendered as a generic row
    #[serde(other)]
    Unknown,
}

impl StageElementType {
    pub fn state_type(&self) -> Option<StateType> {
        match self {
            Self::EnvState => Some(StateType::EnvState),
            Self::EnvLoopState => Some(StateType::EnvLoopState),
            Self::EnvRollbackState => Some(StateType::EnvRollbackState),
            Self::Approval => Some(StateType::Approval),
            Self::Unknown => None,
        }
    }

    /// Stage kinds that wrap a nested workflow execution
    pub fn wraps_workflow(&self) -> bool {
        matches!(
            self,
            Self::EnvState | Self::EnvLoopState | Self::EnvRollbackState
        )
    }
}

/// Infrastructure deployment type of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentType {
    Ssh,
    WinRm,
    Kubernetes,
    Ecs,
    Pcf,
    Ami,
    Spotinst,
    Helm,
    AwsLambda,
    AwsCodeDeploy,
    Custom,
}

impl DeploymentType {
    /// Deployment types that can redeploy a previous artifact set on demand
    pub fn supports_on_demand_rollback(&self) -> bool {
        matches!(
            self,
            Self::Ssh | Self::WinRm | Self::Kubernetes | Self::Ecs | Self::Pcf | Self::Ami | Self::Spotinst
        )
    }
}

/// Orchestration strategy of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationWorkflowType {
    Basic,
    Canary,
    Rolling,
    BlueGreen,
    MultiService,
    Build,
    Custom,
}

/// How a trigger request reached the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TriggerOrigin {
    #[default]
    Manual,
    /// Fired by an automated trigger (webhook, schedule, artifact arrival)
    Trigger(String),
    /// Invoked with an API key
    ApiKey(String),
}

impl TriggerOrigin {
    /// Runs that bypass interactive RBAC unless webhook authorization is required
    pub fn is_automated(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_stage_types_deserialize_to_unknown() {
        let parsed: StageElementType = serde_json::from_str("\"SPOTINST_DEPLOY\"").unwrap();
        assert_eq!(parsed, StageElementType::Unknown);
        assert_eq!(parsed.state_type(), None);
    }

    #[test]
    fn only_all_variants_are_pipeline_level() {
        assert!(ExecutionInterruptType::AbortAll.is_pipeline_level());
        assert!(!ExecutionInterruptType::Pause.is_pipeline_level());
        assert!(!ExecutionInterruptType::Rollback.is_pipeline_level());
    }

    #[test]
    fn rollback_support_matrix() {
        assert!(DeploymentType::Kubernetes.supports_on_demand_rollback());
        assert!(DeploymentType::Ami.supports_on_demand_rollback());
        assert!(!DeploymentType::Helm.supports_on_demand_rollback());
        assert!(!DeploymentType::AwsLambda.supports_on_demand_rollback());
    }
}
