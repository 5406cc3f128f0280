//! # State Execution Instances
//!
//! Append-only ground truth written by the runtime as it enters and leaves
//! states. Every read projection (pipeline rows, breakdowns, the rendered graph)
//! is a function of these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::{DeploymentType, ExecutionInterruptType, ExecutionStatus, StateType};

/// Recorded approver decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Expired,
}

impl ApprovalDecision {
    /// Status the approval step ends in
    pub fn resulting_status(&self) -> ExecutionStatus {
        match self {
            Self::Approved => ExecutionStatus::Success,
            Self::Rejected => ExecutionStatus::Rejected,
            Self::Expired => ExecutionStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalData {
    /// Correlation id the suspended runtime is waiting on
    pub approval_id: String,
    #[serde(default)]
    pub user_group_ids: Vec<String>,
    #[serde(default)]
    pub service_ids: Vec<String>,
    #[serde(default)]
    pub infra_definition_ids: Vec<String>,
    pub timeout_ms: u64,
    pub approved_by: Option<String>,
    pub approved_on: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub decision: Option<ApprovalDecision>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl ApprovalData {
    /// Sorted scope used to find approvals for the same deployment target
    pub fn scope(&self) -> (Vec<String>, Vec<String>) {
        let mut services = self.service_ids.clone();
        let mut infras = self.infra_definition_ids.clone();
        services.sort();
        services.dedup();
        infras.sort();
        infras.dedup();
        (services, infras)
    }
}

/// Reference from a pipeline env stage to the workflow execution it launched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvStateData {
    pub workflow_id: String,
    pub workflow_execution_id: Option<Uuid>,
    pub env_id: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub waiting_for_inputs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkData {
    pub fork_state_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipData {
    pub skip_assertion_expression: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatData {
    pub repeat_element_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatusSummary {
    pub host_name: String,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementStatusSummary {
    pub element_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub instance_status_summaries: Vec<InstanceStatusSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseData {
    pub phase_name: String,
    pub service_id: Option<String>,
    pub infra_definition_id: Option<String>,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub element_status_summary: Vec<ElementStatusSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentData {
    pub deployment_type: DeploymentType,
    pub instance_count: u32,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraintData {
    pub resource_name: String,
    pub unit: String,
    pub permits: u32,
}

/// Per-state-kind execution payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StateExecutionData {
    #[default]
    None,
    Approval(ApprovalData),
    Env(EnvStateData),
    Fork(ForkData),
    Skip(SkipData),
    Repeat(RepeatData),
    Phase(PhaseData),
    Deployment(DeploymentData),
    ResourceConstraint(ResourceConstraintData),
}

impl StateExecutionData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Approval(_) => "approval",
            Self::Env(_) => "env",
            Self::Fork(_) => "fork",
            Self::Skip(_) => "skip",
            Self::Repeat(_) => "repeat",
            Self::Phase(_) => "phase",
            Self::Deployment(_) => "deployment",
            Self::ResourceConstraint(_) => "resource_constraint",
        }
    }

    pub fn as_approval(&self) -> Option<&ApprovalData> {
        match self {
            Self::Approval(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_approval_mut(&mut self) -> Option<&mut ApprovalData> {
        match self {
            Self::Approval(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_env(&self) -> Option<&EnvStateData> {
        match self {
            Self::Env(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_phase(&self) -> Option<&PhaseData> {
        match self {
            Self::Phase(data) => Some(data),
            _ => None,
        }
    }
}

/// Context element pushed by repeat/fork states (service, infra, host, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextElement {
    pub element_type: String,
    pub uuid: String,
    pub name: String,
}

/// Record of an interrupt applied to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub interrupt_type: ExecutionInterruptType,
    pub applied_at: DateTime<Utc>,
}

/// One executed node of a state machine run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateExecutionInstance {
    pub uuid: Uuid,
    pub app_id: String,
    pub account_id: String,
    pub execution_uuid: Uuid,
    pub state_name: String,
    /// Name shown to users; pipeline rows match stage elements on this
    pub display_name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,
    pub parent_instance_id: Option<Uuid>,
    pub prev_instance_id: Option<Uuid>,
    #[serde(default)]
    pub context_elements: Vec<ContextElement>,
    #[serde(default)]
    pub state_execution_data: StateExecutionData,
    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,
    #[serde(default)]
    pub rollback: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Logical clock value assigned by the store on every write
    #[serde(default)]
    pub revision: u64,
}

impl StateExecutionInstance {
    pub fn new(
        execution_uuid: Uuid,
        app_id: impl Into<String>,
        account_id: impl Into<String>,
        display_name: impl Into<String>,
        state_type: StateType,
        status: ExecutionStatus,
    ) -> Self {
        let display_name = display_name.into();
        Self {
            uuid: Uuid::new_v4(),
            app_id: app_id.into(),
            account_id: account_id.into(),
            execution_uuid,
            state_name: display_name.clone(),
            display_name,
            state_type,
            status,
            parent_instance_id: None,
            prev_instance_id: None,
            context_elements: Vec::new(),
            state_execution_data: StateExecutionData::None,
            interrupt_history: Vec::new(),
            rollback: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            revision: 0,
        }
    }

    pub fn with_data(mut self, data: StateExecutionData) -> Self {
        self.state_execution_data = data;
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_instance_id = Some(parent);
        self
    }

    /// The nested workflow execution this instance launched, if any
    pub fn child_execution_id(&self) -> Option<Uuid> {
        self.state_execution_data
            .as_env()
            .and_then(|env| env.workflow_execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_data_is_tagged_by_kind() {
        let data = StateExecutionData::Env(EnvStateData {
            workflow_id: "wf".into(),
            ..Default::default()
        });
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "env");
        assert_eq!(json["data"]["workflow_id"], "wf");
    }

    #[test]
    fn approval_scope_is_order_insensitive() {
        let a = ApprovalData {
            service_ids: vec!["s2".into(), "s1".into()],
            infra_definition_ids: vec!["i1".into()],
            ..Default::default()
        };
        let b = ApprovalData {
            service_ids: vec!["s1".into(), "s2".into(), "s1".into()],
            infra_definition_ids: vec!["i1".into()],
            ..Default::default()
        };
        assert_eq!(a.scope(), b.scope());
    }

    #[test]
    fn child_execution_id_only_for_env_data() {
        let child = Uuid::new_v4();
        let inst = StateExecutionInstance::new(
            Uuid::new_v4(),
            "app",
            "acc",
            "dev",
            StateType::EnvState,
            ExecutionStatus::Running,
        )
        .with_data(StateExecutionData::Env(EnvStateData {
            workflow_id: "wf".into(),
            workflow_execution_id: Some(child),
            ..Default::default()
        }));
        assert_eq!(inst.child_execution_id(), Some(child));
    }
}
