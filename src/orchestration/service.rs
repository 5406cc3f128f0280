//! # Workflow Execution Service
//!
//! Single entry point for callers outside the crate. Wires the orchestration
//! components around one [`SystemContext`] and handles the runtime's status
//! callbacks, which fan out into breakdown freezing, permit release and
//! pipeline projection refresh.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{events, ExecutionStatus};
use crate::errors::{DeployError, DeployResult};
use crate::logging::{log_error, log_execution_operation};
use crate::models::{
    Artifact, CallerContext, ExecutionArgs, ExecutionInterrupt, StateExecutionInstance,
    WorkflowExecution, WorkflowTree,
};
use crate::state_machine::ExecutionEvent;
use crate::store::{ExecutionQuery, ExecutionStore};
use crate::system_context::SystemContext;

use super::admission::AdmissionService;
use super::approval::{ApprovalDetails, ApprovalGateController, ApprovalOutcome};
use super::graph_cache::GraphCache;
use super::interrupts::{InterruptPropagator, InterruptReceipt};
use super::pipeline_stage::PipelineStageOrchestrator;
use super::rollback::RollbackEngine;
use super::status::BreakdownCalculator;

#[derive(Debug, Clone)]
pub struct WorkflowExecutionService {
    context: Arc<SystemContext>,
    admission: AdmissionService,
    pipeline_stages: PipelineStageOrchestrator,
    breakdowns: BreakdownCalculator,
    graph_cache: GraphCache,
    interrupts: InterruptPropagator,
    approvals: ApprovalGateController,
    rollback: RollbackEngine,
}

impl WorkflowExecutionService {
    /// Build every component around the context. Must be called inside a
    /// Tokio runtime; the interrupt cascade worker is spawned here.
    pub fn new(context: Arc<SystemContext>) -> Self {
        let admission = AdmissionService::new(context.clone());
        let interrupts = InterruptPropagator::new(context.clone());
        Self {
            pipeline_stages: PipelineStageOrchestrator::new(context.clone()),
            breakdowns: BreakdownCalculator::new(context.clone()),
            graph_cache: GraphCache::new(context.clone()),
            approvals: ApprovalGateController::new(context.clone(), interrupts.clone()),
            rollback: RollbackEngine::new(context.clone(), admission.clone()),
            admission,
            interrupts,
            context,
        }
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.context
    }

    pub fn admission(&self) -> &AdmissionService {
        &self.admission
    }

    pub fn pipeline_stages(&self) -> &PipelineStageOrchestrator {
        &self.pipeline_stages
    }

    pub fn breakdowns(&self) -> &BreakdownCalculator {
        &self.breakdowns
    }

    pub fn graph_cache(&self) -> &GraphCache {
        &self.graph_cache
    }

    pub fn rollback_engine(&self) -> &RollbackEngine {
        &self.rollback
    }

    fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.context.store
    }

    // ---- triggers ----

    pub async fn trigger_workflow_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        workflow_id: &str,
        args: ExecutionArgs,
    ) -> DeployResult<WorkflowExecution> {
        self.admission
            .trigger_workflow_execution(caller, app_id, workflow_id, args)
            .await
    }

    pub async fn trigger_pipeline_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        pipeline_id: &str,
        args: ExecutionArgs,
    ) -> DeployResult<WorkflowExecution> {
        self.admission
            .trigger_pipeline_execution(caller, app_id, pipeline_id, args)
            .await
    }

    pub async fn trigger_rollback_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        execution_uuid: Uuid,
    ) -> DeployResult<WorkflowExecution> {
        self.rollback
            .trigger_rollback_execution(caller, app_id, execution_uuid)
            .await
    }

    // ---- interrupts and approvals ----

    pub async fn issue_interrupt(
        &self,
        caller: &CallerContext,
        interrupt: ExecutionInterrupt,
    ) -> DeployResult<InterruptReceipt> {
        let receipt = self.interrupts.issue_interrupt(caller, interrupt).await?;
        if receipt.finalized {
            self.admission
                .release_permits(receipt.interrupt.execution_uuid)
                .await;
        }
        Ok(receipt)
    }

    pub async fn approve_or_reject_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        execution_uuid: Uuid,
        details: ApprovalDetails,
    ) -> DeployResult<ApprovalOutcome> {
        self.approvals
            .approve_or_reject_execution(caller, app_id, execution_uuid, details)
            .await
    }

    pub async fn fetch_approval_state_execution_data(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
        state_execution_instance_id: Option<Uuid>,
        approval_id: &str,
    ) -> DeployResult<crate::models::ApprovalData> {
        self.approvals
            .fetch_approval_state_execution_data(
                app_id,
                execution_uuid,
                state_execution_instance_id,
                approval_id,
            )
            .await
    }

    pub async fn expire_approval(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
        approval_id: &str,
    ) -> DeployResult<bool> {
        self.approvals
            .expire_approval(app_id, execution_uuid, approval_id)
            .await
    }

    // ---- runtime callbacks ----

    /// Status reported by the runtime for a whole execution
    #[instrument(skip(self), fields(status = %status))]
    pub async fn execution_status_updated(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
        status: ExecutionStatus,
    ) -> DeployResult<WorkflowExecution> {
        let mut execution = self.load(app_id, execution_uuid).await?;
        self.context
            .execution_state_machine()
            .transition(&mut execution, ExecutionEvent::Report(status))
            .await?;

        if !execution.status.is_final() {
            return Ok(execution);
        }

        if let Err(e) = self.breakdowns.refresh_breakdown(&mut execution).await {
            log_error("service", "freeze_breakdown", &e.to_string(), Some(&execution_uuid.to_string()));
        }

        self.admission.release_permits(execution.uuid).await;

        if execution.is_pipeline() {
            if let Err(e) = self
                .pipeline_stages
                .refresh_pipeline_execution(&mut execution, None)
                .await
            {
                log_error("service", "refresh_pipeline", &e.to_string(), Some(&execution_uuid.to_string()));
            }
        } else if let Some(parent_id) = execution.pipeline_execution_id {
            self.refresh_parent_pipeline(app_id, parent_id).await;
        }

        let _ = self
            .context
            .event_publisher
            .publish(
                events::EXECUTION_COMPLETED,
                json!({
                    "execution_uuid": execution.uuid,
                    "app_id": execution.app_id,
                    "status": execution.status,
                    "breakdown": execution.breakdown,
                    "total": execution.total,
                }),
            )
            .await;
        log_execution_operation(
            "complete",
            execution.uuid,
            &execution.app_id,
            execution.status.as_str(),
            None,
        );
        Ok(execution)
    }

    /// Status reported by the runtime for a single state. Projections pick it
    /// up through the state-instance watermark.
    pub async fn state_execution_status_updated(
        &self,
        instance: &StateExecutionInstance,
    ) -> DeployResult<()> {
        debug!(
            execution_uuid = %instance.execution_uuid,
            state = %instance.display_name,
            state_type = ?instance.state_type,
            status = %instance.status,
            revision = instance.revision,
            "State execution status updated"
        );
        Ok(())
    }

    async fn refresh_parent_pipeline(&self, app_id: &str, parent_id: Uuid) {
        match self.store().get_execution(app_id, parent_id).await {
            Ok(Some(mut parent)) => {
                if let Err(e) = self
                    .pipeline_stages
                    .refresh_pipeline_execution(&mut parent, None)
                    .await
                {
                    warn!(pipeline_execution = %parent_id, error = %e, "Parent pipeline refresh failed");
                }
            }
            Ok(None) => warn!(pipeline_execution = %parent_id, "Parent pipeline execution not found"),
            Err(e) => warn!(pipeline_execution = %parent_id, error = %e, "Failed to load parent pipeline"),
        }
    }

    // ---- reads ----

    /// Execution with refreshed projections; refresh failures are logged and
    /// the stored projection is returned
    pub async fn get_execution_details(
        &self,
        caller: Option<&CallerContext>,
        app_id: &str,
        execution_uuid: Uuid,
    ) -> DeployResult<WorkflowExecution> {
        let mut execution = self.load(app_id, execution_uuid).await?;
        if let Err(e) = self.refresh(&mut execution, caller).await {
            warn!(execution_uuid = %execution_uuid, error = %e, "Serving execution without refreshed projections");
        }
        Ok(execution)
    }

    /// Rendered state graph, served from cache while fresh
    pub async fn get_execution_graph(&self, app_id: &str, execution_uuid: Uuid) -> DeployResult<WorkflowTree> {
        self.load(app_id, execution_uuid).await?;
        self.graph_cache.calculate_tree(execution_uuid).await
    }

    /// Matching executions with refreshed projections. Records whose refresh
    /// fails are excluded rather than failing the listing.
    pub async fn list_executions(
        &self,
        caller: Option<&CallerContext>,
        query: &ExecutionQuery,
    ) -> DeployResult<Vec<WorkflowExecution>> {
        let executions = self.store().query_executions(query).await?;
        let mut listed = Vec::with_capacity(executions.len());
        for mut execution in executions {
            match self.refresh(&mut execution, caller).await {
                Ok(()) => listed.push(execution),
                Err(e) => log_error(
                    "service",
                    "list_executions",
                    &e.to_string(),
                    Some(&execution.uuid.to_string()),
                ),
            }
        }
        Ok(listed)
    }

    async fn refresh(
        &self,
        execution: &mut WorkflowExecution,
        caller: Option<&CallerContext>,
    ) -> DeployResult<()> {
        if execution.is_pipeline() {
            self.pipeline_stages
                .refresh_pipeline_execution(execution, caller)
                .await?;
        }
        self.breakdowns.refresh_breakdown(execution).await
    }

    /// Artifacts of the most recent successful run of the workflow, optionally
    /// on one of the given infrastructure mappings
    pub async fn obtain_last_good_deployed_artifacts(
        &self,
        app_id: &str,
        workflow_id: &str,
        infra_mapping_ids: &[String],
    ) -> DeployResult<Vec<Artifact>> {
        let successes = self
            .store()
            .query_executions(
                &ExecutionQuery::for_app(app_id)
                    .workflow(workflow_id)
                    .statuses([ExecutionStatus::Success]),
            )
            .await?;
        Ok(successes
            .into_iter()
            .find(|execution| {
                infra_mapping_ids.is_empty()
                    || execution
                        .infra_mapping_ids
                        .iter()
                        .any(|id| infra_mapping_ids.contains(id))
            })
            .map(|execution| execution.args.artifacts)
            .unwrap_or_default())
    }

    /// Executions queued on resource constraints this execution holds
    pub async fn list_waiting_on_deployments(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
    ) -> DeployResult<Vec<WorkflowExecution>> {
        let execution = self.load(app_id, execution_uuid).await?;
        let holder = execution
            .pipeline_execution_id
            .filter(|_| !execution.is_pipeline())
            .map(|pipeline_id| vec![execution.uuid, pipeline_id])
            .unwrap_or_else(|| vec![execution.uuid]);

        let mut waiting = Vec::new();
        for entity in holder {
            for queued in self
                .context
                .resource_constraints
                .queued_behind(&entity.to_string())
                .await?
            {
                let Ok(queued_id) = Uuid::parse_str(&queued) else {
                    warn!(entity = %queued, "Queued consumer is not an execution id");
                    continue;
                };
                match self.store().get_execution(app_id, queued_id).await? {
                    Some(found) => waiting.push(found),
                    None => {
                        // Pipeline-scoped permits are held by the pipeline run
                        let nested = self
                            .store()
                            .query_executions(&ExecutionQuery {
                                app_id: Some(app_id.to_string()),
                                pipeline_execution_id: Some(queued_id),
                                statuses: vec![ExecutionStatus::Waiting],
                                ..Default::default()
                            })
                            .await?;
                        waiting.extend(nested);
                    }
                }
            }
        }
        info!(execution_uuid = %execution_uuid, waiting = waiting.len(), "Listed executions waiting on resource constraints");
        Ok(waiting)
    }

    pub async fn execution_interrupts(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
    ) -> DeployResult<Vec<ExecutionInterrupt>> {
        self.load(app_id, execution_uuid).await?;
        Ok(self.store().list_interrupts(execution_uuid).await?)
    }

    /// Number of interrupts applied to each state instance that has any
    pub async fn interrupt_counts_by_state(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
    ) -> DeployResult<HashMap<Uuid, usize>> {
        self.load(app_id, execution_uuid).await?;
        Ok(self
            .store()
            .list_state_instances(execution_uuid)
            .await?
            .into_iter()
            .filter(|instance| !instance.interrupt_history.is_empty())
            .map(|instance| (instance.uuid, instance.interrupt_history.len()))
            .collect())
    }

    pub async fn shutdown(&self) -> DeployResult<()> {
        self.interrupts.shutdown().await
    }

    async fn load(&self, app_id: &str, execution_uuid: Uuid) -> DeployResult<WorkflowExecution> {
        self.store()
            .get_execution(app_id, execution_uuid)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("Execution {execution_uuid} not found")))
    }
}
