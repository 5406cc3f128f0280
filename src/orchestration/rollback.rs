//! # Rollback Engine
//!
//! On-demand rollback redeploys the artifact set of an earlier successful run
//! on the same workflow and infrastructure mapping. The compensating execution
//! runs a dedicated rollback state machine and goes through the normal trigger
//! path, so admission policies apply to it as well.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::constants::{events, ExecutionStatus};
use crate::errors::{DeployError, DeployResult};
use crate::logging::log_execution_operation;
use crate::models::{Artifact, CallerContext, ExecutionArgs, WorkflowExecution};
use crate::services::FeatureFlag;
use crate::state_machine::StateMachine;
use crate::store::ExecutionQuery;
use crate::system_context::SystemContext;

use super::admission::{AdmissionService, TriggerOptions};

/// Where a rollback request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackOrigin {
    #[default]
    OnDemand,
    /// A pipeline rollback stage; multi-infrastructure workflows are allowed
    Pipeline,
}

#[derive(Debug, Clone)]
pub struct RollbackEngine {
    context: Arc<SystemContext>,
    admission: AdmissionService,
}

impl RollbackEngine {
    pub fn new(context: Arc<SystemContext>, admission: AdmissionService) -> Self {
        Self { context, admission }
    }

    /// Roll back a completed workflow execution to its previous artifacts
    pub async fn trigger_rollback_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        execution_uuid: Uuid,
    ) -> DeployResult<WorkflowExecution> {
        self.trigger_rollback_execution_from(caller, app_id, execution_uuid, RollbackOrigin::OnDemand)
            .await
    }

    #[instrument(skip(self, caller), fields(user = %caller.user_id))]
    pub async fn trigger_rollback_execution_from(
        &self,
        caller: &CallerContext,
        app_id: &str,
        execution_uuid: Uuid,
        origin: RollbackOrigin,
    ) -> DeployResult<WorkflowExecution> {
        let source = self
            .context
            .store
            .get_execution(app_id, execution_uuid)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("Execution {execution_uuid} not found")))?;

        self.validate_rollback(&source, origin).await?;
        let previous = self
            .validate_and_get_previous_artifacts(&source, self.diff_aware(&source.account_id))
            .await?;

        let workflow = self
            .context
            .definitions
            .get_workflow(app_id, &source.workflow_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("Workflow {} not found", source.workflow_id)))?;
        let machine = StateMachine::rollback_for(&workflow)?;

        let args = ExecutionArgs {
            artifacts: previous,
            manifest_ids: source.args.manifest_ids.clone(),
            workflow_variables: source.args.workflow_variables.clone(),
            target_hosts: source.args.target_hosts.clone(),
            infra_definition_ids: source.infra_definition_ids.clone(),
            ..Default::default()
        };

        let rollback = self
            .admission
            .trigger_workflow_execution_with(
                caller,
                app_id,
                &source.workflow_id,
                args,
                TriggerOptions {
                    rollback_of: Some(source.uuid),
                    state_machine: Some(machine),
                    ..Default::default()
                },
            )
            .await?;

        let _ = self
            .context
            .event_publisher
            .publish(
                events::ROLLBACK_TRIGGERED,
                json!({
                    "execution_uuid": rollback.uuid,
                    "original_execution": source.uuid,
                    "app_id": app_id,
                    "artifacts": rollback.args.artifact_ids(),
                }),
            )
            .await;
        log_execution_operation(
            "rollback",
            rollback.uuid,
            app_id,
            rollback.status.as_str(),
            Some(&format!("rollback of {}", source.uuid)),
        );
        Ok(rollback)
    }

    /// Refuse rollbacks of runs that cannot or should not be compensated
    pub async fn validate_rollback(
        &self,
        source: &WorkflowExecution,
        origin: RollbackOrigin,
    ) -> DeployResult<()> {
        if source.is_pipeline() {
            return Err(DeployError::RollbackPrecondition(
                "Pipeline executions cannot be rolled back on demand".to_string(),
            ));
        }
        if !source.status.is_final() {
            return Err(DeployError::RollbackPrecondition(format!(
                "Execution {} is still {}",
                source.uuid, source.status
            )));
        }
        if source.on_demand_rollback {
            return Err(DeployError::RollbackPrecondition(
                "A rollback execution cannot be rolled back again".to_string(),
            ));
        }
        if origin == RollbackOrigin::OnDemand && source.infra_definition_ids.len() != 1 {
            return Err(DeployError::RollbackPrecondition(format!(
                "Rollback requires exactly one infrastructure definition, execution targets {}",
                source.infra_definition_ids.len()
            )));
        }
        match source.deployment_type {
            Some(deployment_type) if deployment_type.supports_on_demand_rollback() => {}
            Some(deployment_type) => {
                return Err(DeployError::RollbackPrecondition(format!(
                    "Deployment type {deployment_type:?} does not support rollback"
                )))
            }
            None => {
                return Err(DeployError::RollbackPrecondition(
                    "Execution has no deployment type".to_string(),
                ))
            }
        }

        for infra_mapping_id in &source.infra_mapping_ids {
            let related = self
                .context
                .store
                .query_executions(
                    &ExecutionQuery::for_app(&source.app_id).infra_mapping(infra_mapping_id),
                )
                .await?;
            if related
                .iter()
                .any(|other| other.original_execution == Some(source.uuid))
            {
                return Err(DeployError::RollbackPrecondition(format!(
                    "Execution {} was already rolled back",
                    source.uuid
                )));
            }
            if let Some(active) = related
                .iter()
                .find(|other| other.uuid != source.uuid && !other.status.is_final())
            {
                return Err(DeployError::RollbackPrecondition(format!(
                    "Execution {} is in progress on the same infrastructure",
                    active.uuid
                )));
            }
        }
        Ok(())
    }

    /// Artifacts the rollback should redeploy
    pub async fn validate_and_get_previous_artifacts(
        &self,
        source: &WorkflowExecution,
        diff_aware: bool,
    ) -> DeployResult<Vec<Artifact>> {
        let mut history = Vec::new();
        for infra_mapping_id in &source.infra_mapping_ids {
            history.extend(
                self.context
                    .store
                    .query_executions(
                        &ExecutionQuery::for_app(&source.app_id)
                            .workflow(&source.workflow_id)
                            .infra_mapping(infra_mapping_id)
                            .created_before(source.created_at),
                    )
                    .await?,
            );
        }
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.dedup_by_key(|execution| execution.uuid);

        match select_previous_execution(source, &history, diff_aware) {
            Some(previous) => {
                debug!(
                    source = %source.uuid,
                    previous = %previous.uuid,
                    diff_aware = diff_aware,
                    "Resolved rollback artifacts"
                );
                Ok(previous.args.artifacts.clone())
            }
            None if source.args.artifacts.is_empty() => Ok(Vec::new()),
            None => Err(DeployError::RollbackPrecondition(format!(
                "No previous successful execution with {} artifacts found for execution {}",
                if diff_aware { "different" } else { "deployable" },
                source.uuid
            ))),
        }
    }

    fn diff_aware(&self, account_id: &str) -> bool {
        let enabled = self.context.config().rollback.artifact_diff_aware
            || self
                .context
                .feature_flags
                .is_enabled(FeatureFlag::ArtifactDiffAwareRollback, account_id);
        if enabled {
            info!(account_id = %account_id, "Using artifact diff-aware rollback");
        }
        enabled
    }
}

/// Pick the earlier successful run to roll back to from newest-first history.
///
/// Diff-aware mode skips runs that deployed the same artifact set as the
/// source; two empty sets are treated as different.
pub fn select_previous_execution<'a>(
    source: &WorkflowExecution,
    history: &'a [WorkflowExecution],
    diff_aware: bool,
) -> Option<&'a WorkflowExecution> {
    let source_artifacts = source.args.artifact_ids();
    history
        .iter()
        .filter(|candidate| candidate.uuid != source.uuid)
        .filter(|candidate| candidate.created_at < source.created_at)
        .filter(|candidate| candidate.status == ExecutionStatus::Success)
        .find(|candidate| {
            if !diff_aware {
                return true;
            }
            let artifacts = candidate.args.artifact_ids();
            (artifacts.is_empty() && source_artifacts.is_empty()) || artifacts != source_artifacts
        })
}
