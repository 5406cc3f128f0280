//! # Workflow Execution
//!
//! One deployment run, either a single orchestration or a pipeline. The
//! `breakdown` and the embedded [`PipelineExecution`] are read projections that
//! are recomputed from state instances; everything else is authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::definition::Pipeline;
use crate::constants::{
    DeploymentType, ExecutionStatus, OrchestrationWorkflowType, StageElementType, TriggerOrigin,
    WorkflowType,
};

/// A deployable build of an artifact stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub uuid: String,
    pub artifact_stream_id: String,
    pub build_no: String,
    #[serde(default)]
    pub service_ids: Vec<String>,
}

impl Artifact {
    pub fn new(
        uuid: impl Into<String>,
        artifact_stream_id: impl Into<String>,
        build_no: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            artifact_stream_id: artifact_stream_id.into(),
            build_no: build_no.into(),
            service_ids: Vec::new(),
        }
    }
}

/// Artifact or manifest reference that must be resolved from a parameterized source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactVariable {
    pub name: String,
    pub artifact_stream_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Execution arguments supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionArgs {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub manifest_ids: Vec<String>,
    /// References still to be resolved; non-empty means the run starts in PREPARING
    #[serde(default)]
    pub artifact_variables: Vec<ArtifactVariable>,
    #[serde(default)]
    pub workflow_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub target_hosts: Vec<String>,
    #[serde(default)]
    pub origin: TriggerOrigin,
    /// Supplied by the caller when a rollback targets a specific infrastructure
    #[serde(default)]
    pub infra_definition_ids: Vec<String>,
}

impl ExecutionArgs {
    pub fn needs_preparation(&self) -> bool {
        !self.artifact_variables.is_empty()
    }

    /// Artifact identity set used for rollback comparisons
    pub fn artifact_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.artifacts.iter().map(|a| a.uuid.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Per-status host/stage counts of a refreshed execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakdown {
    pub success: u32,
    pub failed: u32,
    pub inprogress: u32,
    pub queued: u32,
}

impl Breakdown {
    pub fn total(&self) -> u32 {
        self.success + self.failed + self.inprogress + self.queued
    }

    /// Tally one unit with the given status
    pub fn record(&mut self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Success | ExecutionStatus::Skipped => self.success += 1,
            s if s.is_broken() => self.failed += 1,
            ExecutionStatus::Starting
            | ExecutionStatus::Running
            | ExecutionStatus::Pausing
            | ExecutionStatus::Discontinuing => self.inprogress += 1,
            _ => self.queued += 1,
        }
    }
}

/// Parallel group a pipeline stage belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelInfo {
    pub group_index: u32,
}

/// Slim view of a nested (env-stage) workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedExecution {
    pub uuid: Uuid,
    pub name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub env_ids: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Approval-specific view attached to an APPROVAL stage row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStageInfo {
    pub approval_id: String,
    pub authorized: bool,
    #[serde(default)]
    pub user_group_names: Vec<String>,
}

/// One derived row of a pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStageExecution {
    pub pipeline_stage_element_id: String,
    pub state_name: String,
    pub state_type: StageElementType,
    pub status: ExecutionStatus,
    pub parallel_info: ParallelInfo,
    #[serde(default)]
    pub workflow_executions: Vec<NestedExecution>,
    pub state_execution_instance_id: Option<Uuid>,
    pub estimated_time_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub waiting_for_inputs: bool,
    #[serde(default)]
    pub needs_input_but_not_received_yet: bool,
    #[serde(default)]
    pub skip_condition: Option<String>,
    #[serde(default)]
    pub approval: Option<ApprovalStageInfo>,
}

impl PipelineStageExecution {
    /// A row for a stage element that has not been entered yet
    pub fn placeholder(
        element_id: impl Into<String>,
        state_name: impl Into<String>,
        state_type: StageElementType,
        group_index: u32,
    ) -> Self {
        Self {
            pipeline_stage_element_id: element_id.into(),
            state_name: state_name.into(),
            state_type,
            status: ExecutionStatus::Queued,
            parallel_info: ParallelInfo { group_index },
            workflow_executions: Vec::new(),
            state_execution_instance_id: None,
            estimated_time_ms: None,
            started_at: None,
            ended_at: None,
            message: None,
            waiting_for_inputs: false,
            needs_input_but_not_received_yet: false,
            skip_condition: None,
            approval: None,
        }
    }
}

/// Pipeline projection embedded in a PIPELINE-type execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub pipeline_id: String,
    /// Definition snapshot taken at trigger time
    pub pipeline: Pipeline,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub pipeline_stage_executions: Vec<PipelineStageExecution>,
}

impl PipelineExecution {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline_id: pipeline.uuid.clone(),
            pipeline,
            status: ExecutionStatus::New,
            pipeline_stage_executions: Vec::new(),
        }
    }

    /// True when every nested workflow execution recorded so far is final
    pub fn nested_executions_final(&self) -> bool {
        self.pipeline_stage_executions
            .iter()
            .flat_map(|stage| stage.workflow_executions.iter())
            .all(|nested| nested.status.is_final())
    }
}

/// One deployment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub uuid: Uuid,
    pub app_id: String,
    pub account_id: String,
    /// Workflow id for orchestrations, pipeline id for pipelines
    pub workflow_id: String,
    pub name: String,
    pub workflow_type: WorkflowType,
    pub status: ExecutionStatus,
    pub args: ExecutionArgs,
    #[serde(default)]
    pub service_ids: Vec<String>,
    #[serde(default)]
    pub env_ids: Vec<String>,
    #[serde(default)]
    pub infra_mapping_ids: Vec<String>,
    #[serde(default)]
    pub infra_definition_ids: Vec<String>,
    pub deployment_type: Option<DeploymentType>,
    pub orchestration_type: Option<OrchestrationWorkflowType>,
    pub breakdown: Option<Breakdown>,
    #[serde(default)]
    pub total: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub on_demand_rollback: bool,
    pub original_execution: Option<Uuid>,
    #[serde(default)]
    pub can_override_freeze: bool,
    #[serde(default)]
    pub rejected_by_freeze_window_ids: Vec<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub pipeline_execution: Option<PipelineExecution>,
    /// Set on nested executions launched by a pipeline stage
    pub pipeline_execution_id: Option<Uuid>,
    pub triggered_by: Option<String>,
    /// Monotonic store revision, assigned on every write
    #[serde(default)]
    pub revision: u64,
}

impl WorkflowExecution {
    /// Create a NEW execution with empty projections
    pub fn new(
        app_id: impl Into<String>,
        account_id: impl Into<String>,
        workflow_id: impl Into<String>,
        name: impl Into<String>,
        workflow_type: WorkflowType,
        args: ExecutionArgs,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            app_id: app_id.into(),
            account_id: account_id.into(),
            workflow_id: workflow_id.into(),
            name: name.into(),
            workflow_type,
            status: ExecutionStatus::New,
            args,
            service_ids: Vec::new(),
            env_ids: Vec::new(),
            infra_mapping_ids: Vec::new(),
            infra_definition_ids: Vec::new(),
            deployment_type: None,
            orchestration_type: None,
            breakdown: None,
            total: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            on_demand_rollback: false,
            original_execution: None,
            can_override_freeze: false,
            rejected_by_freeze_window_ids: Vec::new(),
            rejection_reason: None,
            pipeline_execution: None,
            pipeline_execution_id: None,
            triggered_by: None,
            revision: 0,
        }
    }

    pub fn is_pipeline(&self) -> bool {
        self.workflow_type == WorkflowType::Pipeline
    }

    pub fn nested_summary(&self) -> NestedExecution {
        NestedExecution {
            uuid: self.uuid,
            name: self.name.clone(),
            status: self.status,
            env_ids: self.env_ids.clone(),
            error_message: self.rejection_reason.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Sorted service/infra scope used to match approvals across runs
    pub fn approval_scope(&self) -> (Vec<String>, Vec<String>) {
        let mut services = self.service_ids.clone();
        let mut infras = self.infra_definition_ids.clone();
        services.sort();
        services.dedup();
        infras.sort();
        infras.dedup();
        (services, infras)
    }
}
