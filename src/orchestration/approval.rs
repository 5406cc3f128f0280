//! # Approval Gate Controller
//!
//! An approval step is QUEUED, then PAUSED while it waits for a decision, then
//! SUCCESS or REJECTED (EXPIRED once its timeout elapses). Decisions are
//! recorded on the state instance and delivered to the suspended runtime
//! through wait/notify, keyed by the approval id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{events, ExecutionInterruptType, ExecutionStatus, StateType, TriggerOrigin};
use crate::errors::{DeployError, DeployResult};
use crate::logging::log_error;
use crate::models::{
    ApprovalData, ApprovalDecision, CallerContext, ExecutionInterrupt, StateExecutionInstance,
    WorkflowExecution,
};
use crate::services::{FeatureFlag, NotifyPayload};
use crate::store::{ExecutionQuery, StateInstanceQuery};
use crate::system_context::SystemContext;

use super::interrupts::{validate_interrupt, InterruptPropagator};

/// What the approver asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalAction {
    Approve,
    Reject,
    /// Reject and roll the owning workflow back
    Rollback,
    /// Reject and roll back provisioners after the deployment phases
    RollbackProvisionerAfterPhases,
}

impl ApprovalAction {
    pub fn decision(&self) -> ApprovalDecision {
        match self {
            Self::Approve => ApprovalDecision::Approved,
            _ => ApprovalDecision::Rejected,
        }
    }

    fn rollback_interrupt(&self) -> Option<ExecutionInterruptType> {
        match self {
            Self::Rollback => Some(ExecutionInterruptType::Rollback),
            Self::RollbackProvisionerAfterPhases => {
                Some(ExecutionInterruptType::RollbackProvisionerAfterPhases)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDetails {
    pub approval_id: String,
    pub action: ApprovalAction,
    pub comments: Option<String>,
    /// Variables captured from the approver and handed to later states
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl ApprovalDetails {
    pub fn new(approval_id: impl Into<String>, action: ApprovalAction) -> Self {
        Self {
            approval_id: approval_id.into(),
            action,
            comments: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

/// Result of a recorded decision
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub state_instance: StateExecutionInstance,
    pub rollback_interrupt: Option<ExecutionInterrupt>,
    /// Executions whose paused approvals were rejected as superseded
    pub auto_rejected: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ApprovalGateController {
    context: Arc<SystemContext>,
    interrupts: InterruptPropagator,
}

impl ApprovalGateController {
    pub fn new(context: Arc<SystemContext>, interrupts: InterruptPropagator) -> Self {
        Self {
            context,
            interrupts,
        }
    }

    /// Record an approver's decision and resume the waiting execution
    #[instrument(skip(self, caller, details), fields(approval_id = %details.approval_id, action = ?details.action))]
    pub async fn approve_or_reject_execution(
        &self,
        caller: &CallerContext,
        app_id: &str,
        execution_uuid: Uuid,
        details: ApprovalDetails,
    ) -> DeployResult<ApprovalOutcome> {
        let execution = self.load_execution(app_id, execution_uuid).await?;

        if execution.is_pipeline() && details.action.rollback_interrupt().is_some() {
            return Err(DeployError::Unsupported(
                "Rollback from a pipeline approval is not supported".to_string(),
            ));
        }

        let mut instance = self
            .find_waiting_approval(&execution, None, &details.approval_id)
            .await?;
        let approval = instance
            .state_execution_data
            .as_approval()
            .cloned()
            .ok_or_else(|| DeployError::Internal("Approval instance lost its data".to_string()))?;
        authorize_approver(caller, &approval)?;

        // Approvers do not need interrupt permissions to roll back
        let rollback = details.action.rollback_interrupt().map(|interrupt_type| {
            let mut interrupt = ExecutionInterrupt::new(app_id, execution.uuid, interrupt_type)
                .targeting_state(instance.uuid);
            interrupt.created_by = Some(caller.user_name.clone());
            interrupt
        });
        if let Some(interrupt) = &rollback {
            validate_interrupt(&execution, interrupt)?;
        }

        let decision = details.action.decision();
        let now = Utc::now();
        if let Some(data) = instance.state_execution_data.as_approval_mut() {
            data.approved_by = Some(caller.user_name.clone());
            data.approved_on = Some(now);
            data.comments = details.comments.clone();
            data.decision = Some(decision);
            data.variables.extend(details.variables.clone());
        }
        instance.status = decision.resulting_status();
        instance.ended_at = Some(now);
        let instance = self.context.store.save_state_instance(&instance).await?;

        self.notify(&instance).await?;

        let rollback_interrupt = match rollback {
            Some(interrupt) => Some(self.interrupts.raise_interrupt(interrupt).await?.interrupt),
            None => None,
        };

        let auto_rejected = if decision == ApprovalDecision::Approved
            && self
                .context
                .feature_flags
                .is_enabled(FeatureFlag::AutoRejectPreviousDeployments, &execution.account_id)
        {
            self.auto_reject_previous(&execution, &approval).await
        } else {
            Vec::new()
        };

        let _ = self
            .context
            .event_publisher
            .publish(
                events::APPROVAL_DECIDED,
                json!({
                    "approval_id": details.approval_id,
                    "execution_uuid": execution.uuid,
                    "decision": decision,
                    "approved_by": caller.user_name,
                    "auto_rejected": auto_rejected,
                }),
            )
            .await;
        info!(
            execution_uuid = %execution.uuid,
            decision = ?decision,
            auto_rejected = auto_rejected.len(),
            "Approval decided"
        );

        Ok(ApprovalOutcome {
            state_instance: instance,
            rollback_interrupt,
            auto_rejected,
        })
    }

    /// The PAUSED approval with `approval_id`, looked up on a workflow (by
    /// state instance when given) or on the pipeline projection
    pub async fn fetch_approval_state_execution_data(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
        state_execution_instance_id: Option<Uuid>,
        approval_id: &str,
    ) -> DeployResult<ApprovalData> {
        let execution = self.load_execution(app_id, execution_uuid).await?;
        let instance = self
            .find_waiting_approval(&execution, state_execution_instance_id, approval_id)
            .await?;
        instance
            .state_execution_data
            .as_approval()
            .cloned()
            .ok_or_else(|| DeployError::Internal("Approval instance lost its data".to_string()))
    }

    /// Expire a waiting approval whose timeout has elapsed; `false` when it
    /// still has time left
    pub async fn expire_approval(
        &self,
        app_id: &str,
        execution_uuid: Uuid,
        approval_id: &str,
    ) -> DeployResult<bool> {
        let execution = self.load_execution(app_id, execution_uuid).await?;
        let mut instance = self
            .find_waiting_approval(&execution, None, approval_id)
            .await?;
        let now = Utc::now();
        let waiting_since = instance.started_at.unwrap_or(instance.created_at);
        let timeout_ms = instance
            .state_execution_data
            .as_approval()
            .map(|approval| approval.timeout_ms)
            .filter(|timeout| *timeout > 0)
            .unwrap_or(self.context.config().approvals.default_timeout_ms);
        if (now - waiting_since).num_milliseconds() < timeout_ms as i64 {
            return Ok(false);
        }

        if let Some(data) = instance.state_execution_data.as_approval_mut() {
            data.decision = Some(ApprovalDecision::Expired);
            data.approved_on = Some(now);
        }
        instance.status = ExecutionStatus::Expired;
        instance.ended_at = Some(now);
        let instance = self.context.store.save_state_instance(&instance).await?;
        self.notify(&instance).await?;
        info!(execution_uuid = %execution_uuid, approval_id = %approval_id, "Approval expired");
        Ok(true)
    }

    async fn load_execution(&self, app_id: &str, execution_uuid: Uuid) -> DeployResult<WorkflowExecution> {
        self.context
            .store
            .get_execution(app_id, execution_uuid)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("Execution {execution_uuid} not found")))
    }

    async fn find_waiting_approval(
        &self,
        execution: &WorkflowExecution,
        state_execution_instance_id: Option<Uuid>,
        approval_id: &str,
    ) -> DeployResult<StateExecutionInstance> {
        let waiting = |instance: &StateExecutionInstance| {
            instance.status == ExecutionStatus::Paused
                && instance
                    .state_execution_data
                    .as_approval()
                    .is_some_and(|approval| approval.approval_id == approval_id)
        };

        if let Some(state_id) = state_execution_instance_id {
            if let Some(instance) = self.context.store.get_state_instance(state_id).await? {
                if instance.execution_uuid == execution.uuid && waiting(&instance) {
                    return Ok(instance);
                }
            }
        } else {
            // Pipeline rows point straight at the approval's instance
            let projected = execution
                .pipeline_execution
                .iter()
                .flat_map(|pe| pe.pipeline_stage_executions.iter())
                .filter(|row| {
                    row.status == ExecutionStatus::Paused
                        && row
                            .approval
                            .as_ref()
                            .is_some_and(|info| info.approval_id == approval_id)
                })
                .find_map(|row| row.state_execution_instance_id);
            if let Some(state_id) = projected {
                if let Some(instance) = self.context.store.get_state_instance(state_id).await? {
                    if waiting(&instance) {
                        return Ok(instance);
                    }
                }
            }

            let query = StateInstanceQuery {
                execution_uuid: Some(execution.uuid),
                state_type: Some(StateType::Approval),
                statuses: vec![ExecutionStatus::Paused],
                ..Default::default()
            };
            if let Some(instance) = self
                .context
                .store
                .find_state_instances(&query)
                .await?
                .into_iter()
                .find(|instance| waiting(instance))
            {
                return Ok(instance);
            }
        }

        let kind = if execution.is_pipeline() { "Pipeline" } else { "Workflow" };
        Err(DeployError::NotFound(format!(
            "No {kind} execution [{}] waiting for approval id: {approval_id}",
            execution.uuid
        )))
    }

    async fn notify(&self, instance: &StateExecutionInstance) -> DeployResult<()> {
        let Some(approval) = instance.state_execution_data.as_approval() else {
            return Ok(());
        };
        self.context
            .wait_notify
            .done_with(&approval.approval_id, NotifyPayload::Approval(approval.clone()))
            .await
    }

    /// Reject paused approvals with the same service/infra scope in other runs
    async fn auto_reject_previous(
        &self,
        approved: &WorkflowExecution,
        approval: &ApprovalData,
    ) -> Vec<Uuid> {
        let scope = approval.scope();
        let own_run = approved.pipeline_execution_id.unwrap_or(approved.uuid);
        let comment = format!(
            "Rejected automatically: a later deployment was approved: {}",
            self.context
                .config()
                .approvals
                .execution_url(&approved.app_id, approved.uuid)
        );

        let candidates = match self
            .context
            .store
            .query_executions(
                &ExecutionQuery::for_app(&approved.app_id).statuses(ExecutionStatus::non_final()),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                log_error("approval", "auto_reject_previous", &e.to_string(), None);
                return Vec::new();
            }
        };

        let mut rejected = Vec::new();
        for candidate in candidates {
            let candidate_run = candidate.pipeline_execution_id.unwrap_or(candidate.uuid);
            if candidate.uuid == approved.uuid || candidate_run == own_run {
                continue;
            }
            match self.reject_superseded(&candidate, &scope, &comment).await {
                Ok(0) => {}
                Ok(count) => {
                    debug!(execution_uuid = %candidate.uuid, approvals = count, "Rejected superseded approvals");
                    rejected.push(candidate.uuid);
                }
                Err(e) => warn!(
                    execution_uuid = %candidate.uuid,
                    error = %e,
                    "Failed to auto-reject superseded approval"
                ),
            }
        }
        rejected
    }

    async fn reject_superseded(
        &self,
        execution: &WorkflowExecution,
        scope: &(Vec<String>, Vec<String>),
        comment: &str,
    ) -> DeployResult<usize> {
        let query = StateInstanceQuery {
            execution_uuid: Some(execution.uuid),
            state_type: Some(StateType::Approval),
            statuses: vec![ExecutionStatus::Paused],
            ..Default::default()
        };
        let mut count = 0;
        for mut instance in self.context.store.find_state_instances(&query).await? {
            let same_scope = instance
                .state_execution_data
                .as_approval()
                .is_some_and(|other| &other.scope() == scope);
            if !same_scope {
                continue;
            }
            let now = Utc::now();
            if let Some(data) = instance.state_execution_data.as_approval_mut() {
                data.decision = Some(ApprovalDecision::Rejected);
                data.comments = Some(comment.to_string());
                data.approved_on = Some(now);
            }
            instance.status = ExecutionStatus::Rejected;
            instance.ended_at = Some(now);
            let instance = self.context.store.save_state_instance(&instance).await?;
            self.notify(&instance).await?;
            count += 1;
        }
        Ok(count)
    }
}

/// Approvals without approver groups accept anyone; otherwise the caller (or
/// the API key) must belong to one of the groups
pub fn authorize_approver(caller: &CallerContext, approval: &ApprovalData) -> DeployResult<()> {
    if approval.user_group_ids.is_empty() || caller.shares_group_with(&approval.user_group_ids) {
        return Ok(());
    }
    let who = match &caller.origin {
        TriggerOrigin::ApiKey(key) => format!("API key {key}"),
        _ => format!("User {}", caller.user_id),
    };
    Err(DeployError::Unauthorized(format!(
        "{who} is not authorized to accept or reject the approval"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval(groups: &[&str]) -> ApprovalData {
        ApprovalData {
            approval_id: "ap-1".into(),
            user_group_ids: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn open_approvals_accept_anyone() {
        let caller = CallerContext::user("acc", "u1", "one");
        assert!(authorize_approver(&caller, &approval(&[])).is_ok());
    }

    #[test]
    fn api_keys_need_a_shared_group() {
        let key = CallerContext::user("acc", "key", "ci")
            .with_origin(TriggerOrigin::ApiKey("k-1".into()))
            .with_groups(["g2"]);
        let err = authorize_approver(&key, &approval(&["g1"])).unwrap_err();
        assert!(err.to_string().contains("API key k-1"));

        let key = key.with_groups(["g1", "g2"]);
        assert!(authorize_approver(&key, &approval(&["g1"])).is_ok());
    }

    #[test]
    fn rollback_actions_reject() {
        assert_eq!(ApprovalAction::Rollback.decision(), ApprovalDecision::Rejected);
        assert_eq!(
            ApprovalAction::Rollback.rollback_interrupt(),
            Some(ExecutionInterruptType::Rollback)
        );
        assert_eq!(ApprovalAction::Approve.rollback_interrupt(), None);
    }
}
