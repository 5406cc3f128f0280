//! # Execution Store
//!
//! Durable document records for executions, state instances, interrupts and
//! cached trees. Writes to read projections are optimistic: an update against a
//! missing record is a no-op, and pipeline projections are written against an
//! expected revision so a lost race surfaces as
//! [`StoreError::ConcurrentModification`] and the next read recomputes.
//!
//! Every write stamps the record with a revision drawn from one monotonic
//! logical clock. The graph cache compares those revisions instead of wall-clock
//! timestamps.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::constants::{ExecutionStatus, StateType};
use crate::errors::StoreResult;
use crate::models::{
    Artifact, Breakdown, ExecutionInterrupt, PipelineExecution, StateExecutionInstance,
    WorkflowExecution, WorkflowTree,
};

pub use memory::InMemoryExecutionStore;
pub use postgres::PgExecutionStore;

/// Which replica a query may be served from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadPreference {
    #[default]
    Primary,
    /// Analytics-style listings that tolerate replication lag
    Secondary,
}

/// Filter for execution listings; results are newest first
#[derive(Debug, Clone, Default)]
pub struct ExecutionQuery {
    pub app_id: Option<String>,
    pub account_id: Option<String>,
    pub workflow_id: Option<String>,
    pub infra_mapping_id: Option<String>,
    pub pipeline_execution_id: Option<Uuid>,
    pub statuses: Vec<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub read_preference: ReadPreference,
}

impl ExecutionQuery {
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            ..Default::default()
        }
    }

    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Default::default()
        }
    }

    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn infra_mapping(mut self, infra_mapping_id: impl Into<String>) -> Self {
        self.infra_mapping_id = Some(infra_mapping_id.into());
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn secondary(mut self) -> Self {
        self.read_preference = ReadPreference::Secondary;
        self
    }

    /// In-process evaluation of the filter, shared by the in-memory store
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.app_id.as_ref().map_or(true, |a| &execution.app_id == a)
            && self
                .account_id
                .as_ref()
                .map_or(true, |a| &execution.account_id == a)
            && self
                .workflow_id
                .as_ref()
                .map_or(true, |w| &execution.workflow_id == w)
            && self
                .infra_mapping_id
                .as_ref()
                .map_or(true, |i| execution.infra_mapping_ids.contains(i))
            && self
                .pipeline_execution_id
                .map_or(true, |p| execution.pipeline_execution_id == Some(p))
            && (self.statuses.is_empty() || self.statuses.contains(&execution.status))
            && self
                .created_after
                .map_or(true, |t| execution.created_at > t)
            && self
                .created_before
                .map_or(true, |t| execution.created_at < t)
    }
}

/// Field-level update applied without a revision check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub breakdown: Option<(Breakdown, u32)>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Resolved artifacts; also clears the pending artifact variables
    pub resolved_artifacts: Option<Vec<Artifact>>,
    pub rejection_reason: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn breakdown(breakdown: Breakdown, total: u32) -> Self {
        Self {
            breakdown: Some((breakdown, total)),
            ..Default::default()
        }
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    pub fn with_rejection_reason(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = Some(reason.into());
        self
    }

    pub fn apply(&self, execution: &mut WorkflowExecution) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some((breakdown, total)) = self.breakdown {
            execution.breakdown = Some(breakdown);
            execution.total = total;
        }
        if let Some(at) = self.started_at {
            execution.started_at.get_or_insert(at);
        }
        if let Some(at) = self.ended_at {
            execution.ended_at = Some(at);
        }
        if let Some(artifacts) = &self.resolved_artifacts {
            execution.args.artifacts = artifacts.clone();
            execution.args.artifact_variables.clear();
        }
        if let Some(reason) = &self.rejection_reason {
            execution.rejection_reason = Some(reason.clone());
        }
    }
}

/// Filter for state-instance lookups; results are in creation order
#[derive(Debug, Clone, Default)]
pub struct StateInstanceQuery {
    pub account_id: Option<String>,
    pub execution_uuid: Option<Uuid>,
    pub state_type: Option<StateType>,
    pub statuses: Vec<ExecutionStatus>,
}

impl StateInstanceQuery {
    pub fn for_execution(execution_uuid: Uuid) -> Self {
        Self {
            execution_uuid: Some(execution_uuid),
            ..Default::default()
        }
    }

    pub fn matches(&self, instance: &StateExecutionInstance) -> bool {
        self.account_id
            .as_ref()
            .map_or(true, |a| &instance.account_id == a)
            && self
                .execution_uuid
                .map_or(true, |e| instance.execution_uuid == e)
            && self.state_type.map_or(true, |t| instance.state_type == t)
            && (self.statuses.is_empty() || self.statuses.contains(&instance.status))
    }
}

#[async_trait]
pub trait ExecutionStore: std::fmt::Debug + Send + Sync + 'static {
    /// Insert or replace an execution, returning it with its new revision
    async fn save_execution(&self, execution: &WorkflowExecution)
        -> StoreResult<WorkflowExecution>;

    async fn get_execution(&self, app_id: &str, uuid: Uuid)
        -> StoreResult<Option<WorkflowExecution>>;

    /// Apply a field-level update and return the new revision; `None` when
    /// the execution does not exist
    async fn update_execution(
        &self,
        uuid: Uuid,
        update: &ExecutionUpdate,
    ) -> StoreResult<Option<u64>>;

    /// Replace the pipeline projection if the stored revision still matches.
    /// Returns the new revision, `None` when the execution does not exist.
    async fn update_pipeline_execution(
        &self,
        uuid: Uuid,
        expected_revision: u64,
        pipeline_execution: &PipelineExecution,
    ) -> StoreResult<Option<u64>>;

    async fn query_executions(&self, query: &ExecutionQuery)
        -> StoreResult<Vec<WorkflowExecution>>;

    async fn save_state_instance(
        &self,
        instance: &StateExecutionInstance,
    ) -> StoreResult<StateExecutionInstance>;

    async fn get_state_instance(&self, uuid: Uuid) -> StoreResult<Option<StateExecutionInstance>>;

    async fn find_state_instances(
        &self,
        query: &StateInstanceQuery,
    ) -> StoreResult<Vec<StateExecutionInstance>>;

    /// Highest revision across an execution's state instances, 0 when none exist
    async fn max_state_revision(&self, execution_uuid: Uuid) -> StoreResult<u64>;

    async fn save_interrupt(&self, interrupt: &ExecutionInterrupt) -> StoreResult<()>;

    async fn list_interrupts(&self, execution_uuid: Uuid) -> StoreResult<Vec<ExecutionInterrupt>>;

    /// Cached tree unless missing or past its `expires_at`
    async fn get_tree(&self, execution_uuid: Uuid) -> StoreResult<Option<WorkflowTree>>;

    async fn upsert_tree(&self, tree: &WorkflowTree) -> StoreResult<()>;

    async fn update_status(&self, uuid: Uuid, status: ExecutionStatus) -> StoreResult<bool> {
        Ok(self
            .update_execution(uuid, &ExecutionUpdate::status(status))
            .await?
            .is_some())
    }

    async fn list_state_instances(
        &self,
        execution_uuid: Uuid,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        self.find_state_instances(&StateInstanceQuery::for_execution(execution_uuid))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WorkflowType;
    use crate::models::ExecutionArgs;

    #[test]
    fn query_matches_on_infra_mapping_and_status() {
        let mut exec = WorkflowExecution::new(
            "app",
            "acc",
            "wf",
            "deploy",
            WorkflowType::Orchestration,
            ExecutionArgs::default(),
        );
        exec.infra_mapping_ids = vec!["im-1".into()];
        exec.status = ExecutionStatus::Running;

        let query = ExecutionQuery::for_app("app")
            .infra_mapping("im-1")
            .statuses(ExecutionStatus::non_final());
        assert!(query.matches(&exec));

        exec.status = ExecutionStatus::Success;
        assert!(!query.matches(&exec));
    }

    #[test]
    fn update_keeps_first_start_time() {
        let mut exec = WorkflowExecution::new(
            "app",
            "acc",
            "wf",
            "deploy",
            WorkflowType::Orchestration,
            ExecutionArgs::default(),
        );
        let first = Utc::now();
        ExecutionUpdate::status(ExecutionStatus::Running)
            .with_started_at(first)
            .apply(&mut exec);
        ExecutionUpdate::status(ExecutionStatus::Running)
            .with_started_at(first + chrono::Duration::seconds(10))
            .apply(&mut exec);
        assert_eq!(exec.started_at, Some(first));
        assert_eq!(exec.status, ExecutionStatus::Running);
    }
}
