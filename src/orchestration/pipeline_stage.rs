//! # Pipeline Stage Orchestrator
//!
//! Rebuilds the `PipelineStageExecution` rows of a pipeline run from the state
//! instances recorded for it. The rows are a pure projection of those
//! instances: recomputing is always safe, so a conflicting write is dropped
//! and the next read recomputes.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::constants::{ExecutionStatus, StageElementType};
use crate::errors::{DeployError, DeployResult};
use crate::logging::log_error;
use crate::models::{
    ApprovalStageInfo, CallerContext, NestedExecution, PipelineStageElement,
    PipelineStageExecution, StateExecutionData, StateExecutionInstance, WorkflowExecution,
};
use crate::store::{ExecutionQuery, StateInstanceQuery};
use crate::system_context::SystemContext;

#[derive(Debug, Clone)]
pub struct PipelineStageOrchestrator {
    context: Arc<SystemContext>,
}

impl PipelineStageOrchestrator {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Reconcile the stage rows of a pipeline execution in place and persist
    /// them. `caller` decides the `authorized` flag on approval rows.
    #[instrument(skip_all, fields(execution_uuid = %execution.uuid))]
    pub async fn refresh_pipeline_execution(
        &self,
        execution: &mut WorkflowExecution,
        caller: Option<&CallerContext>,
    ) -> DeployResult<()> {
        let Some(pipeline_execution) = execution.pipeline_execution.as_ref() else {
            return Ok(());
        };
        if pipeline_execution.status.is_final() && pipeline_execution.nested_executions_final() {
            debug!("Pipeline projection already final");
            return Ok(());
        }

        let pipeline = pipeline_execution.pipeline.clone();
        let instances = self
            .context
            .store
            .find_state_instances(&StateInstanceQuery::for_execution(execution.uuid))
            .await?;
        // Later instances with the same display name supersede earlier ones
        let by_name: HashMap<&str, &StateExecutionInstance> = instances
            .iter()
            .map(|instance| (instance.display_name.as_str(), instance))
            .collect();

        let mut rows = Vec::with_capacity(pipeline.element_count());
        let mut rollback_rows: Vec<(u32, PipelineStageExecution)> = Vec::new();

        for (group_index, element) in pipeline.elements_with_groups() {
            let Some(instance) = by_name.get(element.name.as_str()).copied() else {
                if element.element_type == StageElementType::EnvRollbackState {
                    continue;
                }
                let mut row = PipelineStageExecution::placeholder(
                    &element.uuid,
                    &element.name,
                    element.element_type,
                    group_index,
                );
                if element.disabled {
                    row.status = ExecutionStatus::Skipped;
                }
                row.estimated_time_ms = pipeline.estimate_for(element);
                row.needs_input_but_not_received_yet = element.requires_runtime_inputs;
                rows.push(row);
                continue;
            };

            let mut row = base_row(element, instance, group_index);

            if let StateExecutionData::Skip(skip) = &instance.state_execution_data {
                row.skip_condition = Some(skip.skip_assertion_expression.clone());
                row.message = skip.message.clone();
                rows.push(row);
                continue;
            }

            match element.element_type {
                StageElementType::Approval => {
                    if let Some(approval) = instance.state_execution_data.as_approval() {
                        let user_group_names = self
                            .context
                            .authorization
                            .user_group_names(&execution.account_id, &approval.user_group_ids)
                            .await
                            .unwrap_or_else(|e| {
                                warn!(error = %e, "Failed to resolve approver group names");
                                Vec::new()
                            });
                        let authorized = caller.is_some_and(|caller| {
                            approval.user_group_ids.is_empty()
                                || caller.shares_group_with(&approval.user_group_ids)
                        });
                        row.approval = Some(ApprovalStageInfo {
                            approval_id: approval.approval_id.clone(),
                            authorized,
                            user_group_names,
                        });
                        row.message = approval.comments.clone();
                    }
                    rows.push(row);
                }
                StageElementType::EnvState => {
                    self.attach_nested(&mut row, instance, &execution.app_id).await;
                    rows.push(row);
                }
                StageElementType::EnvLoopState => {
                    let children: Vec<&StateExecutionInstance> = instances
                        .iter()
                        .filter(|child| child.parent_instance_id == Some(instance.uuid))
                        .filter(|child| child.state_execution_data.as_env().is_some())
                        .collect();
                    if children.is_empty() {
                        self.attach_nested(&mut row, instance, &execution.app_id).await;
                        rows.push(row);
                    }
                    for child in children {
                        let mut child_row = base_row(element, child, group_index);
                        child_row.state_name = child.display_name.clone();
                        self.attach_nested(&mut child_row, child, &execution.app_id).await;
                        rows.push(child_row);
                    }
                }
                StageElementType::EnvRollbackState => {
                    self.attach_nested(&mut row, instance, &execution.app_id).await;
                    rollback_rows.push((element.parallel_index, row));
                }
                StageElementType::Unknown => {
                    warn!(
                        stage = %element.name,
                        state_type = ?instance.state_type,
                        "Unknown pipeline stage type, projecting instance status only"
                    );
                    rows.push(row);
                }
            }
        }

        rollback_rows.sort_by_key(|(parallel_index, _)| *parallel_index);
        rows.extend(rollback_rows.into_iter().map(|(_, row)| row));

        let status = aggregate_status(execution.status, &rows);

        let Some(pipeline_execution) = execution.pipeline_execution.as_mut() else {
            return Ok(());
        };
        pipeline_execution.pipeline_stage_executions = rows;
        pipeline_execution.status = status;
        execution.status = status;

        match self
            .context
            .store
            .update_pipeline_execution(execution.uuid, execution.revision, pipeline_execution)
            .await
        {
            Ok(revision) => {
                if let Some(revision) = revision {
                    execution.revision = revision;
                }
                if execution.status.is_final() {
                    self.schedule_estimate_refresh(execution);
                }
            }
            Err(e) => match DeployError::from(e) {
                DeployError::ConcurrentModification { entity } => {
                    warn!(entity = %entity, "Pipeline projection write lost a race; next read recomputes");
                }
                other => return Err(other),
            },
        }
        Ok(())
    }

    async fn attach_nested(
        &self,
        row: &mut PipelineStageExecution,
        instance: &StateExecutionInstance,
        app_id: &str,
    ) {
        let Some(env) = instance.state_execution_data.as_env() else {
            return;
        };
        row.message = env.error_message.clone();
        row.waiting_for_inputs = env.waiting_for_inputs;

        let Some(child_id) = env.workflow_execution_id else {
            return;
        };
        match self.context.store.get_execution(app_id, child_id).await {
            Ok(Some(child)) => {
                let nested: NestedExecution = child.nested_summary();
                row.status = nested.status;
                row.workflow_executions = vec![nested];
            }
            Ok(None) => warn!(child_execution = %child_id, "Nested workflow execution not found"),
            Err(e) => warn!(child_execution = %child_id, error = %e, "Failed to load nested execution"),
        }
    }

    fn schedule_estimate_refresh(&self, execution: &WorkflowExecution) {
        let this = self.clone();
        let app_id = execution.app_id.clone();
        let pipeline_id = execution.workflow_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh_stage_estimates(&app_id, &pipeline_id).await {
                log_error(
                    "pipeline_stage",
                    "refresh_stage_estimates",
                    &e.to_string(),
                    Some(&pipeline_id),
                );
            }
        });
    }

    /// Average stage durations over the most recent successful runs
    pub async fn refresh_stage_estimates(&self, app_id: &str, pipeline_id: &str) -> DeployResult<HashMap<String, i64>> {
        let sample = self.context.config().pipeline.estimate_sample_size;
        let runs = self
            .context
            .store
            .query_executions(
                &ExecutionQuery::for_app(app_id)
                    .workflow(pipeline_id)
                    .statuses([ExecutionStatus::Success])
                    .limit(sample)
                    .secondary(),
            )
            .await?;

        let mut sums: HashMap<String, (i64, i64)> = HashMap::new();
        for row in runs
            .iter()
            .filter_map(|run| run.pipeline_execution.as_ref())
            .flat_map(|pe| pe.pipeline_stage_executions.iter())
        {
            if let (Some(started), Some(ended)) = (row.started_at, row.ended_at) {
                let elapsed = (ended - started).num_milliseconds();
                if elapsed > 0 {
                    let entry = sums.entry(row.pipeline_stage_element_id.clone()).or_default();
                    entry.0 += elapsed;
                    entry.1 += 1;
                }
            }
        }
        let estimates: HashMap<String, i64> = sums
            .into_iter()
            .map(|(element_id, (total, count))| (element_id, total / count))
            .collect();

        self.context
            .definitions
            .update_stage_estimates(app_id, pipeline_id, estimates.clone())
            .await?;
        debug!(pipeline_id = %pipeline_id, stages = estimates.len(), at = %Utc::now(), "Stage estimates refreshed");
        Ok(estimates)
    }
}

fn base_row(
    element: &PipelineStageElement,
    instance: &StateExecutionInstance,
    group_index: u32,
) -> PipelineStageExecution {
    let mut row = PipelineStageExecution::placeholder(
        &element.uuid,
        &element.name,
        element.element_type,
        group_index,
    );
    row.status = instance.status;
    row.state_execution_instance_id = Some(instance.uuid);
    row.started_at = instance.started_at;
    row.ended_at = instance.ended_at;
    row
}

/// Pipeline status: the execution's own final status, then WAITING, then
/// PAUSED while nothing runs, else the execution's status
pub fn aggregate_status(
    execution_status: ExecutionStatus,
    rows: &[PipelineStageExecution],
) -> ExecutionStatus {
    if execution_status.is_final() {
        return execution_status;
    }
    if rows
        .iter()
        .any(|row| row.waiting_for_inputs || row.status == ExecutionStatus::Waiting)
    {
        return ExecutionStatus::Waiting;
    }
    let paused = rows
        .iter()
        .any(|row| matches!(row.status, ExecutionStatus::Paused | ExecutionStatus::Pausing));
    let running = rows.iter().any(|row| row.status == ExecutionStatus::Running);
    if paused && !running {
        return ExecutionStatus::Paused;
    }
    execution_status
}
