//! # Admission & Trigger
//!
//! Validates, rate-limits and launches new workflow and pipeline executions.
//!
//! ## Overview
//!
//! Every trigger runs the same admission sequence before anything is handed to
//! the runtime:
//!
//! 1. authorization (skipped for trigger and API-key origins unless webhook
//!    authorization is required)
//! 2. account status, deployment rate limit and instance usage policies
//! 3. deployment freeze, unless the caller may override it
//!
//! Policy objects return [`PolicyDecision`]s; this module turns a rejection into
//! a typed error, or for freezes with `save_rejected_by_freeze` enabled, into a
//! persisted REJECTED execution.
//!
//! Executions whose arguments reference parameterized artifact sources enter
//! PREPARING and are resolved on a background task. Workflows with a
//! concurrency strategy acquire a resource-constraint permit before starting
//! and stay WAITING while queued.

use dashmap::DashMap;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{events, ExecutionStatus, StageElementType, StateType, WorkflowType};
use crate::errors::{DeployError, DeployResult};
use crate::logging::{log_error, log_execution_operation, log_policy_decision};
use crate::models::{
    CallerContext, ConcurrencyStrategy, ExecutionArgs, HoldingScope, Pipeline, PipelineExecution,
    Variable, Workflow, WorkflowExecution,
};
use crate::services::{
    BarrierParticipant, DeploymentContext, OutputScope, PermitRequest, PermitState,
    PolicyDecision, PolicyKind, PolicyRejection, RuntimeHandle,
};
use crate::state_machine::{ExecutionEvent, StateMachine};
use crate::store::{ExecutionQuery, ExecutionUpdate};
use crate::system_context::SystemContext;

/// Name of the pipeline descriptor written to the output variable store
pub const PIPELINE_ELEMENT_OUTPUT: &str = "pipeline";

/// Outcome of the admission checks
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    /// Freeze breached while rejected executions are persisted
    RejectedByFreeze(PolicyRejection),
}

/// Extra wiring for executions launched by other components
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    /// Parent pipeline run for env-stage workflow executions
    pub pipeline_execution_id: Option<Uuid>,
    /// Source execution of an on-demand rollback
    pub rollback_of: Option<Uuid>,
    /// Prebuilt state machine replacing the one generated from the definition
    pub state_machine: Option<StateMachine>,
}

/// A queued execution parked behind a resource-constraint permit
#[derive(Debug, Clone)]
struct ParkedExecution {
    app_id: String,
    execution_uuid: Uuid,
    machine: StateMachine,
    handle: RuntimeHandle,
}

/// Launches executions; cheap to clone so background tasks can own a copy
#[derive(Debug, Clone)]
pub struct AdmissionService {
    context: Arc<SystemContext>,
    preparations: Arc<DashMap<Uuid, JoinHandle<()>>>,
    parked: Arc<DashMap<String, ParkedExecution>>,
}

impl AdmissionService {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self {
            context,
            preparations: Arc::new(DashMap::new()),
            parked: Arc::new(DashMap::new()),
        }
    }

    /// Trigger an orchestration workflow
    #[instrument(skip(self, caller, args), fields(user = %caller.user_id))]
    pub async fn trigger_workflow_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        workflow_id: &str,
        args: ExecutionArgs,
    ) -> DeployResult<WorkflowExecution> {
        self.trigger_workflow_execution_with(caller, app_id, workflow_id, args, TriggerOptions::default())
            .await
    }

    pub async fn trigger_workflow_execution_with(
        &self,
        caller: &CallerContext,
        app_id: &str,
        workflow_id: &str,
        mut args: ExecutionArgs,
        options: TriggerOptions,
    ) -> DeployResult<WorkflowExecution> {
        let workflow = self
            .context
            .definitions
            .get_workflow(app_id, workflow_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("Workflow {workflow_id} not found")))?;

        resolve_variables(&workflow.variables, &mut args.workflow_variables)?;
        args.origin = caller.origin.clone();

        let machine = match options.state_machine {
            Some(machine) => machine,
            None => StateMachine::from_workflow(&workflow)?,
        };

        let mut execution = WorkflowExecution::new(
            app_id,
            &workflow.account_id,
            &workflow.uuid,
            &workflow.name,
            WorkflowType::Orchestration,
            args,
        );
        execution.service_ids = workflow.service_ids.clone();
        execution.env_ids = workflow.env_id.iter().cloned().collect();
        execution.infra_mapping_ids = workflow.infra_mapping_ids.clone();
        execution.infra_definition_ids = if execution.args.infra_definition_ids.is_empty() {
            workflow.infra_definition_ids.clone()
        } else {
            execution.args.infra_definition_ids.clone()
        };
        execution.deployment_type = workflow.orchestration.deployment_type;
        execution.orchestration_type = Some(workflow.orchestration.orchestration_type);
        execution.pipeline_execution_id = options.pipeline_execution_id;
        execution.on_demand_rollback = options.rollback_of.is_some();
        execution.original_execution = options.rollback_of;
        execution.can_override_freeze = caller.permissions.override_freeze;
        execution.triggered_by = Some(caller.user_name.clone());
        execution.total = machine.expected_total();

        self.admit_and_launch(caller, execution, machine, workflow.concurrency_strategy.clone())
            .await
    }

    /// Trigger a pipeline
    #[instrument(skip(self, caller, args), fields(user = %caller.user_id))]
    pub async fn trigger_pipeline_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        pipeline_id: &str,
        mut args: ExecutionArgs,
    ) -> DeployResult<WorkflowExecution> {
        let pipeline = self
            .context
            .definitions
            .get_pipeline(app_id, pipeline_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("Pipeline {pipeline_id} not found")))?;

        // Best effort: concurrent triggers can both pass this check before
        // either execution is saved
        let not_started = self
            .context
            .store
            .query_executions(
                &ExecutionQuery::for_app(app_id)
                    .workflow(pipeline_id)
                    .statuses([ExecutionStatus::New]),
            )
            .await?;
        if !not_started.is_empty() {
            return Err(DeployError::PipelineAlreadyTriggered {
                pipeline_id: pipeline_id.to_string(),
            });
        }

        resolve_variables(&pipeline.variables, &mut args.workflow_variables)?;
        args.origin = caller.origin.clone();
        let machine = StateMachine::from_pipeline(&pipeline)?;

        let mut execution = WorkflowExecution::new(
            app_id,
            &pipeline.account_id,
            &pipeline.uuid,
            &pipeline.name,
            WorkflowType::Pipeline,
            args,
        );
        for workflow in self.stage_workflows(&pipeline).await {
            for service_id in &workflow.service_ids {
                if !execution.service_ids.contains(service_id) {
                    execution.service_ids.push(service_id.clone());
                }
            }
            if let Some(env_id) = &workflow.env_id {
                if !execution.env_ids.contains(env_id) {
                    execution.env_ids.push(env_id.clone());
                }
            }
        }
        execution.pipeline_execution = Some(PipelineExecution::new(pipeline.clone()));
        execution.can_override_freeze = caller.permissions.override_freeze;
        execution.triggered_by = Some(caller.user_name.clone());
        execution.total = machine.expected_total();

        self.admit_and_launch(caller, execution, machine, None).await
    }

    /// Wait for a background artifact preparation to finish
    pub async fn wait_for_preparation(&self, execution_uuid: Uuid) -> DeployResult<()> {
        let Some((_, handle)) = self.preparations.remove(&execution_uuid) else {
            return Ok(());
        };
        handle
            .await
            .map_err(|e| DeployError::Internal(format!("Preparation task failed: {e}")))
    }

    /// Run the admission checks for an execution about to be launched
    pub async fn check_admission(
        &self,
        caller: &CallerContext,
        execution: &WorkflowExecution,
    ) -> DeployResult<Admission> {
        let config = &self.context.config().admission;

        if !caller.origin.is_automated() || config.webhook_authorization_required {
            let allowed = self
                .context
                .authorization
                .can_execute(caller, &execution.app_id, &execution.env_ids)
                .await?;
            if !allowed {
                return Err(DeployError::Unauthorized(format!(
                    "User {} is not allowed to deploy {}",
                    caller.user_name, execution.name
                )));
            }
        }

        let deployment = DeploymentContext {
            account_id: execution.account_id.clone(),
            app_id: execution.app_id.clone(),
            env_ids: execution.env_ids.clone(),
            service_ids: execution.service_ids.clone(),
            workflow_id: execution.workflow_id.clone(),
        };

        for check in self.context.policies.limit_checks() {
            let decision = check.check(&deployment).await?;
            match decision {
                PolicyDecision::Allowed => {
                    log_policy_decision(&check.kind().to_string(), &deployment.account_id, true, None)
                }
                PolicyDecision::Rejected(rejection) => {
                    log_policy_decision(
                        &rejection.policy.to_string(),
                        &deployment.account_id,
                        false,
                        Some(&rejection.reason),
                    );
                    return Err(match rejection.policy {
                        PolicyKind::AccountStatus => DeployError::AccountExpired {
                            account_id: deployment.account_id.clone(),
                        },
                        _ => DeployError::LimitExceeded(rejection.reason),
                    });
                }
            }
        }

        if caller.permissions.override_freeze {
            debug!(account_id = %deployment.account_id, "Caller may override deployment freezes");
            return Ok(Admission::Admitted);
        }

        match self.context.policies.freeze.check(&deployment).await? {
            PolicyDecision::Allowed => Ok(Admission::Admitted),
            PolicyDecision::Rejected(rejection) => {
                log_policy_decision(
                    &rejection.policy.to_string(),
                    &deployment.account_id,
                    false,
                    Some(&rejection.reason),
                );
                if config.save_rejected_by_freeze {
                    Ok(Admission::RejectedByFreeze(rejection))
                } else {
                    Err(DeployError::DeploymentFreeze {
                        freeze_window_ids: rejection.identifiers,
                        message: rejection.reason,
                    })
                }
            }
        }
    }

    async fn admit_and_launch(
        &self,
        caller: &CallerContext,
        execution: WorkflowExecution,
        machine: StateMachine,
        concurrency: Option<ConcurrencyStrategy>,
    ) -> DeployResult<WorkflowExecution> {
        let admission = self.check_admission(caller, &execution).await?;
        let state_machine = self.context.execution_state_machine();

        if let Admission::RejectedByFreeze(rejection) = admission {
            let mut rejected = execution;
            rejected.rejected_by_freeze_window_ids = rejection.identifiers.clone();
            let mut rejected = self.context.store.save_execution(&rejected).await?;
            state_machine
                .transition(&mut rejected, ExecutionEvent::Reject(rejection.reason.clone()))
                .await?;
            log_execution_operation(
                "trigger",
                rejected.uuid,
                &rejected.app_id,
                rejected.status.as_str(),
                Some(&rejection.reason),
            );
            return Ok(rejected);
        }

        let mut execution = self.context.store.save_execution(&execution).await?;

        if let Some(pipeline) = execution
            .pipeline_execution
            .as_ref()
            .map(|pe| pe.pipeline.clone())
        {
            self.construct_barriers(&pipeline, execution.uuid).await?;
        }

        let handle = self.context.runtime.queue(&machine, &execution).await?;

        if execution.args.needs_preparation() {
            state_machine
                .transition(&mut execution, ExecutionEvent::Prepare)
                .await?;
            let this = self.clone();
            let preparing = execution.clone();
            let task = tokio::spawn(async move {
                this.complete_preparation(preparing, machine, handle, concurrency)
                    .await;
            });
            self.preparations.insert(execution.uuid, task);
        } else {
            state_machine
                .transition(&mut execution, ExecutionEvent::Queue)
                .await?;
            self.start(&mut execution, machine, handle, concurrency.as_ref())
                .await?;
        }

        log_execution_operation(
            "trigger",
            execution.uuid,
            &execution.app_id,
            execution.status.as_str(),
            None,
        );
        Ok(execution)
    }

    async fn complete_preparation(
        &self,
        mut execution: WorkflowExecution,
        machine: StateMachine,
        handle: RuntimeHandle,
        concurrency: Option<ConcurrencyStrategy>,
    ) {
        let state_machine = self.context.execution_state_machine();
        let timeout = self.context.config().admission.preparation_timeout();
        let resolution = tokio::time::timeout(
            timeout,
            self.context
                .artifact_resolver
                .resolve(&execution.account_id, &execution.args.artifact_variables),
        )
        .await;

        let outcome = match resolution {
            Ok(Ok(artifacts)) => {
                let update = ExecutionUpdate {
                    resolved_artifacts: Some(artifacts),
                    ..Default::default()
                };
                match self.context.store.update_execution(execution.uuid, &update).await {
                    Ok(revision) => {
                        update.apply(&mut execution);
                        if let Some(revision) = revision {
                            execution.revision = revision;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "Artifact resolution timed out after {}s",
                timeout.as_secs()
            )),
        };

        // An abort may have finalized the execution while it was preparing
        let mut execution = match self
            .context
            .store
            .get_execution(&execution.app_id, execution.uuid)
            .await
        {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!(execution_uuid = %execution.uuid, "Execution disappeared during preparation");
                return;
            }
            Err(e) => {
                log_error(
                    "admission",
                    "complete_preparation",
                    &e.to_string(),
                    Some(&execution.uuid.to_string()),
                );
                return;
            }
        };

        let result = match outcome {
            Ok(()) => match state_machine
                .transition(&mut execution, ExecutionEvent::PreparationSucceeded)
                .await
            {
                Ok(_) => {
                    self.start(&mut execution, machine, handle, concurrency.as_ref())
                        .await
                }
                Err(e) => Err(e.into()),
            },
            Err(reason) => {
                warn!(execution_uuid = %execution.uuid, reason = %reason, "Artifact preparation failed");
                state_machine
                    .transition(&mut execution, ExecutionEvent::PreparationFailed(reason))
                    .await
                    .map(|_| ())
                    .map_err(DeployError::from)
            }
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_benign_race() => {
                info!(execution_uuid = %execution.uuid, "Execution finalized during preparation");
            }
            Err(e) => log_error(
                "admission",
                "complete_preparation",
                &e.to_string(),
                Some(&execution.uuid.to_string()),
            ),
        }
    }

    /// Start a QUEUED execution, parking it behind a permit when required
    async fn start(
        &self,
        execution: &mut WorkflowExecution,
        machine: StateMachine,
        handle: RuntimeHandle,
        concurrency: Option<&ConcurrencyStrategy>,
    ) -> DeployResult<()> {
        let state_machine = self.context.execution_state_machine();

        if let Some(strategy) = concurrency {
            let request = permit_request(strategy, execution);
            match self.context.resource_constraints.acquire(&request).await? {
                PermitState::Active => {
                    debug!(execution_uuid = %execution.uuid, resource = %strategy.resource_name, "Permit acquired");
                }
                PermitState::Queued { position } => {
                    self.parked.insert(
                        request.correlation_id.clone(),
                        ParkedExecution {
                            app_id: execution.app_id.clone(),
                            execution_uuid: execution.uuid,
                            machine,
                            handle,
                        },
                    );
                    state_machine
                        .transition(execution, ExecutionEvent::AwaitPermit)
                        .await?;
                    info!(
                        execution_uuid = %execution.uuid,
                        resource = %strategy.resource_name,
                        position = position,
                        "Execution waiting on resource constraint"
                    );
                    return Ok(());
                }
            }
        }

        if let Some(pipeline) = execution.pipeline_execution.as_ref().map(|pe| &pe.pipeline) {
            self.write_pipeline_descriptor(execution.uuid, &execution.app_id, pipeline)
                .await;
        }

        state_machine
            .transition(execution, ExecutionEvent::Start)
            .await?;
        if let Err(e) = self.context.runtime.start_execution(&machine, &handle).await {
            error!(execution_uuid = %execution.uuid, error = %e, "Runtime failed to start execution");
            state_machine
                .transition(execution, ExecutionEvent::Report(ExecutionStatus::Error))
                .await?;
            return Err(e);
        }

        let _ = self
            .context
            .event_publisher
            .publish(
                events::EXECUTION_TRIGGERED,
                json!({
                    "execution_uuid": execution.uuid,
                    "app_id": execution.app_id,
                    "workflow_id": execution.workflow_id,
                    "workflow_type": execution.workflow_type,
                    "on_demand_rollback": execution.on_demand_rollback,
                }),
            )
            .await;
        Ok(())
    }

    /// Start executions whose queued permits were granted by a release
    /// Drop the permits a finished execution holds or waits on and resume
    /// whatever the release promoted
    pub async fn release_permits(&self, execution_uuid: Uuid) {
        self.parked.retain(|_, parked| parked.execution_uuid != execution_uuid);
        match self
            .context
            .resource_constraints
            .release(&execution_uuid.to_string())
            .await
        {
            Ok(promoted) if !promoted.is_empty() => self.resume_permitted(&promoted).await,
            Ok(_) => {}
            Err(e) => log_error(
                "admission",
                "release_permits",
                &e.to_string(),
                Some(&execution_uuid.to_string()),
            ),
        }
    }

    pub async fn resume_permitted(&self, promoted: &[PermitRequest]) {
        let mut pending: VecDeque<PermitRequest> = promoted.iter().cloned().collect();
        while let Some(request) = pending.pop_front() {
            let Some((_, parked)) = self.parked.remove(&request.correlation_id) else {
                warn!(
                    correlation_id = %request.correlation_id,
                    "Permit granted to an execution not parked in this process"
                );
                continue;
            };
            match self.resume_parked(parked).await {
                Ok(released) => pending.extend(released),
                Err(e) => log_error(
                    "admission",
                    "resume_permitted",
                    &e.to_string(),
                    Some(&request.correlation_id),
                ),
            }
        }
    }

    /// Start a parked execution. One that finished while parked hands its
    /// permit straight back; the requests that release promoted are returned.
    async fn resume_parked(&self, parked: ParkedExecution) -> DeployResult<Vec<PermitRequest>> {
        let mut execution = self
            .context
            .store
            .get_execution(&parked.app_id, parked.execution_uuid)
            .await?
            .ok_or_else(|| {
                DeployError::NotFound(format!("Execution {} not found", parked.execution_uuid))
            })?;
        if execution.status.is_final() {
            info!(
                execution_uuid = %execution.uuid,
                status = %execution.status,
                "Permit granted to a finished execution, releasing it"
            );
            return self
                .context
                .resource_constraints
                .release(&execution.uuid.to_string())
                .await;
        }
        let state_machine = self.context.execution_state_machine();
        state_machine
            .transition(&mut execution, ExecutionEvent::PermitGranted)
            .await?;
        self.context
            .runtime
            .start_execution(&parked.machine, &parked.handle)
            .await?;
        info!(execution_uuid = %execution.uuid, "Execution resumed after permit grant");
        Ok(Vec::new())
    }

    /// One barrier per rendezvous identifier shared inside a parallel group
    async fn construct_barriers(
        &self,
        pipeline: &Pipeline,
        pipeline_execution_id: Uuid,
    ) -> DeployResult<()> {
        for group in pipeline.parallel_groups() {
            let mut participants = Vec::new();
            for element in group.elements {
                if element.disabled || element.element_type != StageElementType::EnvState {
                    continue;
                }
                let Some(workflow_id) = &element.workflow_id else {
                    continue;
                };
                let Some(workflow) = self
                    .context
                    .definitions
                    .get_workflow(&pipeline.app_id, workflow_id)
                    .await?
                else {
                    warn!(workflow_id = %workflow_id, stage = %element.name, "Stage workflow not found");
                    continue;
                };
                participants.push(BarrierParticipant {
                    pipeline_stage_element_id: element.uuid.clone(),
                    workflow_id: workflow.uuid.clone(),
                    barrier_identifiers: barrier_identifiers(&workflow),
                });
            }
            if participants.len() < 2 {
                continue;
            }
            for barrier in self.context.barriers.obtain_instances(
                pipeline_execution_id,
                group.group_index,
                &participants,
            ) {
                self.context.barriers.save(&barrier).await?;
            }
        }
        Ok(())
    }

    async fn write_pipeline_descriptor(&self, execution_uuid: Uuid, app_id: &str, pipeline: &Pipeline) {
        let descriptor = json!({
            "uuid": pipeline.uuid,
            "name": pipeline.name,
            "execution_uuid": execution_uuid,
        });
        if let Err(e) = self
            .context
            .outputs
            .put(
                &OutputScope::pipeline(app_id, execution_uuid),
                PIPELINE_ELEMENT_OUTPUT,
                descriptor,
            )
            .await
        {
            warn!(execution_uuid = %execution_uuid, error = %e, "Failed to store pipeline descriptor");
        }
    }

    async fn stage_workflows(&self, pipeline: &Pipeline) -> Vec<Workflow> {
        let mut workflows = Vec::new();
        for (_, element) in pipeline.elements_with_groups() {
            let Some(workflow_id) = &element.workflow_id else {
                continue;
            };
            match self
                .context
                .definitions
                .get_workflow(&pipeline.app_id, workflow_id)
                .await
            {
                Ok(Some(workflow)) => workflows.push(workflow),
                Ok(None) => warn!(workflow_id = %workflow_id, "Pipeline stage workflow not found"),
                Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Failed to read stage workflow"),
            }
        }
        workflows
    }
}

/// Permit request for an execution of a concurrency-limited workflow
pub fn permit_request(strategy: &ConcurrencyStrategy, execution: &WorkflowExecution) -> PermitRequest {
    let release_entity_id = match (strategy.holding_scope, execution.pipeline_execution_id) {
        (HoldingScope::Pipeline, Some(pipeline_execution_id)) => pipeline_execution_id.to_string(),
        _ => execution.uuid.to_string(),
    };
    PermitRequest {
        resource_name: strategy.resource_name.clone(),
        unit: strategy.unit.clone(),
        capacity: strategy.capacity,
        permits: 1,
        holding_scope: strategy.holding_scope,
        correlation_id: format!("{}-{}", strategy.resource_name, execution.uuid),
        release_entity_id,
    }
}

fn barrier_identifiers(workflow: &Workflow) -> Vec<String> {
    let orchestration = &workflow.orchestration;
    orchestration
        .pre_deployment_steps
        .iter()
        .chain(orchestration.phases.iter().flat_map(|p| p.steps.iter()))
        .chain(orchestration.post_deployment_steps.iter())
        .filter(|step| step.state_type == StateType::Barrier)
        .map(|step| step.name.clone())
        .collect()
}

/// Apply declared variables to the supplied values.
///
/// Fixed variables always take their defined value. Missing values fall back
/// to the default; a mandatory variable with neither fails validation.
/// Empty and `"null"` names are ignored on both sides.
pub fn resolve_variables(
    defined: &[Variable],
    supplied: &mut BTreeMap<String, String>,
) -> DeployResult<()> {
    supplied.retain(|name, _| !is_blank_name(name));

    let mut missing = Vec::new();
    for variable in defined.iter().filter(|v| !is_blank_name(&v.name)) {
        if variable.fixed {
            if let Some(value) = &variable.default_value {
                supplied.insert(variable.name.clone(), value.clone());
            }
            continue;
        }
        let provided = supplied
            .get(&variable.name)
            .is_some_and(|value| !value.trim().is_empty());
        if provided {
            continue;
        }
        match &variable.default_value {
            Some(value) => {
                supplied.insert(variable.name.clone(), value.clone());
            }
            None if variable.mandatory => missing.push(variable.name.clone()),
            None => {}
        }
    }

    if !missing.is_empty() {
        return Err(DeployError::Validation(format!(
            "Workflow variable(s) [{}] are mandatory",
            missing.join(", ")
        )));
    }
    Ok(())
}

fn is_blank_name(name: &str) -> bool {
    name.trim().is_empty() || name == "null"
}
