//! Progress breakdowns.
//!
//! Rolling deployments without host-count telemetry are counted bottom-up from
//! the instance summaries of their phases. Everything else is projected by
//! replaying the static state machine against the statuses known so far.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::constants::{ExecutionStatus, StateType};
use crate::errors::{DeployError, DeployResult};
use crate::models::{Breakdown, StateExecutionInstance, WorkflowExecution};
use crate::state_machine::{BreakdownSimulator, StateMachine};
use crate::store::{ExecutionUpdate, StateInstanceQuery};
use crate::system_context::SystemContext;

#[derive(Debug, Clone)]
pub struct BreakdownCalculator {
    context: Arc<SystemContext>,
}

impl BreakdownCalculator {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Recompute `breakdown` and `total` on the snapshot. Only a final
    /// execution's breakdown is persisted; it never changes afterwards.
    #[instrument(skip_all, fields(execution_uuid = %execution.uuid))]
    pub async fn refresh_breakdown(&self, execution: &mut WorkflowExecution) -> DeployResult<()> {
        if execution.status.is_final() && execution.breakdown.is_some() {
            return Ok(());
        }

        let instances = self
            .context
            .store
            .find_state_instances(&StateInstanceQuery::for_execution(execution.uuid))
            .await?;

        let (breakdown, total) = if execution.is_pipeline() {
            let pipeline = execution
                .pipeline_execution
                .as_ref()
                .map(|pe| &pe.pipeline)
                .ok_or_else(|| {
                    DeployError::Validation(format!(
                        "Pipeline execution {} has no pipeline snapshot",
                        execution.uuid
                    ))
                })?;
            let machine = StateMachine::from_pipeline(pipeline)?;
            simulate(&machine, &instances, execution.status)
        } else {
            let workflow = self
                .context
                .definitions
                .get_workflow(&execution.app_id, &execution.workflow_id)
                .await?
                .ok_or_else(|| {
                    DeployError::NotFound(format!("Workflow {} not found", execution.workflow_id))
                })?;

            if workflow.is_rolling() && !workflow.k8s_v2 && !execution.on_demand_rollback {
                count_rolling_instances(&instances, workflow.expected_instance_count())
            } else {
                let machine = if execution.on_demand_rollback {
                    StateMachine::rollback_for(&workflow)?
                } else {
                    StateMachine::from_workflow(&workflow)?
                };
                simulate(&machine, &instances, execution.status)
            }
        };

        debug!(
            success = breakdown.success,
            failed = breakdown.failed,
            inprogress = breakdown.inprogress,
            queued = breakdown.queued,
            total = total,
            "Breakdown refreshed"
        );

        execution.breakdown = Some(breakdown);
        execution.total = total;

        if execution.status.is_final() {
            if let Some(revision) = self
                .context
                .store
                .update_execution(execution.uuid, &ExecutionUpdate::breakdown(breakdown, total))
                .await?
            {
                execution.revision = revision;
            }
        }
        Ok(())
    }
}

fn simulate(
    machine: &StateMachine,
    instances: &[StateExecutionInstance],
    execution_status: ExecutionStatus,
) -> (Breakdown, u32) {
    let known: HashMap<String, ExecutionStatus> = instances
        .iter()
        .filter(|instance| instance.rollback == machine.rollback)
        .map(|instance| (instance.display_name.clone(), instance.status))
        .collect();
    BreakdownSimulator::simulate(machine, &known, execution_status)
}

/// Tally host statuses across phase summaries, clamped so the counts always
/// add up to the total
pub fn count_rolling_instances(
    instances: &[StateExecutionInstance],
    expected_instances: u32,
) -> (Breakdown, u32) {
    let mut breakdown = Breakdown::default();
    for summary in instances
        .iter()
        .filter(|instance| instance.state_type == StateType::Phase && !instance.rollback)
        .filter_map(|instance| instance.state_execution_data.as_phase())
        .flat_map(|phase| phase.element_status_summary.iter())
        .flat_map(|element| element.instance_status_summaries.iter())
    {
        match summary.status {
            ExecutionStatus::Success => breakdown.success += 1,
            ExecutionStatus::Failed | ExecutionStatus::Error => breakdown.failed += 1,
            ExecutionStatus::Starting | ExecutionStatus::Running => breakdown.inprogress += 1,
            _ => breakdown.queued += 1,
        }
    }

    let counted = breakdown.total();
    let total = expected_instances.max(counted);
    breakdown.queued += total - counted;
    (breakdown, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ElementStatusSummary, InstanceStatusSummary, PhaseData, StateExecutionData,
    };
    use uuid::Uuid;

    fn phase_instance(statuses: &[ExecutionStatus]) -> StateExecutionInstance {
        let summaries = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| InstanceStatusSummary {
                host_name: format!("host-{i}"),
                status: *status,
            })
            .collect();
        StateExecutionInstance::new(
            Uuid::new_v4(),
            "app",
            "acc",
            "Phase 1",
            StateType::Phase,
            ExecutionStatus::Running,
        )
        .with_data(StateExecutionData::Phase(PhaseData {
            phase_name: "Phase 1".into(),
            element_status_summary: vec![ElementStatusSummary {
                element_name: "svc".into(),
                status: ExecutionStatus::Running,
                instance_status_summaries: summaries,
            }],
            ..Default::default()
        }))
    }

    #[test]
    fn rolling_counts_pad_queued_up_to_expected() {
        let instances = vec![phase_instance(&[
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Running,
        ])];
        let (breakdown, total) = count_rolling_instances(&instances, 5);
        assert_eq!(total, 5);
        assert_eq!(breakdown.success, 1);
        assert_eq!(breakdown.failed, 1);
        assert_eq!(breakdown.inprogress, 1);
        assert_eq!(breakdown.queued, 2);
    }

    #[test]
    fn rolling_total_grows_with_observed_hosts() {
        let instances = vec![phase_instance(&[ExecutionStatus::Success; 4])];
        let (breakdown, total) = count_rolling_instances(&instances, 2);
        assert_eq!(total, 4);
        assert_eq!(breakdown.total(), total);
    }
}
