mod common;

use common::*;
use proptest::prelude::*;
use tasker_deploy::constants::{
    ExecutionStatus, OrchestrationWorkflowType, StageElementType, StateType, WorkflowType,
};
use tasker_deploy::models::{
    ElementStatusSummary, ExecutionArgs, InstanceStatusSummary, Pipeline, PipelineExecution,
    PhaseData, StateExecutionData, StateExecutionInstance, WorkflowExecution,
};
use tasker_deploy::orchestration::count_rolling_instances;
use uuid::Uuid;

fn phase_instance(execution_uuid: Uuid, statuses: &[ExecutionStatus]) -> StateExecutionInstance {
    StateExecutionInstance::new(
        execution_uuid,
        APP_ID,
        ACCOUNT_ID,
        "Phase 1",
        StateType::Phase,
        ExecutionStatus::Running,
    )
    .with_data(StateExecutionData::Phase(PhaseData {
        phase_name: "Phase 1".into(),
        element_status_summary: vec![ElementStatusSummary {
            element_name: "svc-1".into(),
            status: ExecutionStatus::Running,
            instance_status_summaries: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| InstanceStatusSummary {
                    host_name: format!("host-{i}"),
                    status: *status,
                })
                .collect(),
        }],
        ..Default::default()
    }))
}

proptest! {
    #[test]
    fn rolling_counts_always_add_up(
        statuses in prop::collection::vec(status_strategy(), 0..20),
        expected in 0u32..12,
    ) {
        let instances = vec![phase_instance(Uuid::new_v4(), &statuses)];
        let (breakdown, total) = count_rolling_instances(&instances, expected);
        prop_assert_eq!(breakdown.total(), total);
        prop_assert!(total >= expected);
        prop_assert!(total as usize >= statuses.len());
    }

    #[test]
    fn pipeline_breakdown_counts_every_enabled_env_stage(
        stages in stages_strategy(),
        statuses in prop::collection::vec(prop::option::of(status_strategy()), 15),
        execution_status in execution_status_strategy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let harness = TestHarness::new();
            let pipeline = Pipeline {
                stages,
                ..pipeline("pl-prop", vec![])
            };
            let mut execution = WorkflowExecution::new(
                APP_ID,
                ACCOUNT_ID,
                &pipeline.uuid,
                &pipeline.name,
                WorkflowType::Pipeline,
                ExecutionArgs::default(),
            );
            execution.status = execution_status;
            execution.pipeline_execution = Some(PipelineExecution::new(pipeline.clone()));
            let mut execution = harness.save(&execution).await;

            let elements: Vec<_> = pipeline
                .elements_with_groups()
                .into_iter()
                .map(|(_, element)| element)
                .collect();
            for (element, status) in elements.iter().zip(statuses.iter()) {
                if let (Some(status), Some(state_type)) = (status, element.element_type.state_type()) {
                    harness
                        .save_instance(&StateExecutionInstance::new(
                            execution.uuid,
                            APP_ID,
                            ACCOUNT_ID,
                            &element.name,
                            state_type,
                            *status,
                        ))
                        .await;
                }
            }

            harness
                .service
                .breakdowns()
                .refresh_breakdown(&mut execution)
                .await
                .unwrap();

            let enabled_env_stages = elements
                .iter()
                .filter(|e| !e.disabled && e.element_type == StageElementType::EnvState)
                .count() as u32;
            let breakdown = execution.breakdown.unwrap();
            prop_assert_eq!(breakdown.total(), execution.total);
            prop_assert_eq!(execution.total, enabled_env_stages);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn rolling_workflow_breakdown_uses_host_summaries() {
    let harness = TestHarness::new();
    let mut definition = workflow("wf-rolling");
    definition.orchestration.orchestration_type = OrchestrationWorkflowType::Rolling;
    definition.orchestration.phases[0].instance_count = 4;
    harness.definitions.add_workflow(definition.clone());

    let mut execution = harness
        .save(&workflow_execution(&definition, ExecutionStatus::Running))
        .await;
    harness
        .save_instance(&phase_instance(
            execution.uuid,
            &[ExecutionStatus::Success, ExecutionStatus::Running],
        ))
        .await;

    harness
        .service
        .breakdowns()
        .refresh_breakdown(&mut execution)
        .await
        .unwrap();

    let breakdown = execution.breakdown.unwrap();
    assert_eq!(execution.total, 4);
    assert_eq!(breakdown.success, 1);
    assert_eq!(breakdown.inprogress, 1);
    assert_eq!(breakdown.queued, 2);
    // Only final breakdowns are persisted
    assert!(harness.load(execution.uuid).await.breakdown.is_none());
}

#[tokio::test]
async fn final_breakdown_is_frozen_on_completion() {
    let harness = TestHarness::new();
    let definition = workflow("wf-1");
    harness.definitions.add_workflow(definition.clone());
    let execution = harness
        .save(&workflow_execution(&definition, ExecutionStatus::Running))
        .await;

    let done = harness
        .service
        .execution_status_updated(APP_ID, execution.uuid, ExecutionStatus::Success)
        .await
        .unwrap();

    let stored = harness.load(done.uuid).await;
    let breakdown = stored.breakdown.unwrap();
    assert_eq!(breakdown.total(), stored.total);
    assert_eq!(breakdown.success, stored.total);
    assert_eq!(breakdown.queued, 0);
}
