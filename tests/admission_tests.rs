mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use tasker_deploy::config::DeployConfig;
use tasker_deploy::constants::{ExecutionInterruptType, ExecutionStatus, TriggerOrigin};
use tasker_deploy::errors::DeployError;
use tasker_deploy::models::{
    ArtifactVariable, ConcurrencyStrategy, ExecutionArgs, ExecutionInterrupt, HoldingScope,
    Variable,
};
use tasker_deploy::services::{AccountStatusChecker, DeploymentRateLimiter, PolicySet};
use tasker_deploy::store::{ExecutionQuery, ExecutionStore};

fn freeze_saving_config() -> DeployConfig {
    let mut config = DeployConfig::default();
    config.admission.save_rejected_by_freeze = true;
    config
}

#[tokio::test]
async fn trigger_starts_execution_on_runtime() {
    let harness = TestHarness::new();
    harness.definitions.add_workflow(workflow("wf-1"));

    let execution = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.infra_mapping_ids, vec!["im-1".to_string()]);
    assert_eq!(execution.triggered_by.as_deref(), Some("Dana Deployer"));
    assert!(harness.runtime.started().contains(&execution.uuid));
    assert!(harness.runtime.queued_machine(execution.uuid).is_some());
    assert_eq!(harness.load(execution.uuid).await.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn freeze_with_save_mode_persists_rejected_execution() {
    let harness = TestHarness::with_config(freeze_saving_config());
    harness.definitions.add_workflow(workflow("wf-1"));
    harness.freeze_now("fw-1");

    let execution = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Rejected);
    assert_eq!(execution.rejected_by_freeze_window_ids, vec!["fw-1".to_string()]);

    let stored = harness.load(execution.uuid).await;
    assert_eq!(stored.status, ExecutionStatus::Rejected);
    assert!(!stored.rejected_by_freeze_window_ids.is_empty());
    assert!(stored
        .rejection_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("fw-1 window")));
    assert!(harness.runtime.started().is_empty());
}

#[tokio::test]
async fn freeze_without_save_mode_blocks_the_trigger() {
    let harness = TestHarness::new();
    harness.definitions.add_workflow(workflow("wf-1"));
    harness.freeze_now("fw-1");

    let err = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap_err();

    match err {
        DeployError::DeploymentFreeze {
            freeze_window_ids, ..
        } => assert_eq!(freeze_window_ids, vec!["fw-1".to_string()]),
        other => panic!("expected freeze error, got {other:?}"),
    }
    assert_eq!(harness.store.execution_count(), 0);
}

#[tokio::test]
async fn freeze_override_permission_bypasses_windows() {
    let harness = TestHarness::with_config(freeze_saving_config());
    harness.definitions.add_workflow(workflow("wf-1"));
    harness.freeze_now("fw-1");

    let execution = harness
        .service
        .trigger_workflow_execution(
            &caller().with_freeze_override(),
            APP_ID,
            "wf-1",
            ExecutionArgs::default(),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Running);
    assert!(execution.can_override_freeze);
}

#[tokio::test]
async fn limit_breach_is_a_distinct_error() {
    let harness = TestHarness::build(DeployConfig::default(), |policies| PolicySet {
        rate_limit: Arc::new(DeploymentRateLimiter::new(1, chrono::Duration::minutes(10))),
        ..policies
    });
    harness.definitions.add_workflow(workflow("wf-1"));

    harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap();
    let err = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::LimitExceeded(_)));
    assert!(err.is_user_error());
}

#[tokio::test]
async fn expired_accounts_cannot_deploy() {
    let accounts = Arc::new(AccountStatusChecker::new());
    accounts.expire(ACCOUNT_ID);
    let harness = TestHarness::build(DeployConfig::default(), |policies| PolicySet {
        account_status: accounts.clone(),
        ..policies
    });
    harness.definitions.add_workflow(workflow("wf-1"));

    let err = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DeployError::AccountExpired {
            account_id: ACCOUNT_ID.to_string()
        }
    );
}

#[tokio::test]
async fn automated_origins_skip_rbac_unless_required() {
    let harness = TestHarness::new();
    harness.definitions.add_workflow(workflow("wf-1"));
    let authorization = tasker_deploy::services::StaticAuthorizationService::new();
    authorization.deny_user("user-1");

    // The harness context keeps the default authorization service, so build
    // one with the denying service for this scenario
    let context = Arc::new(
        tasker_deploy::system_context::SystemContext::builder(harness.context.config_manager.clone())
            .with_store(harness.store.clone())
            .with_definitions(harness.definitions.clone())
            .with_authorization(Arc::new(authorization))
            .build(),
    );
    let service = tasker_deploy::orchestration::WorkflowExecutionService::new(context);

    let err = service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Unauthorized(_)));

    let webhook = caller().with_origin(TriggerOrigin::Trigger("on-artifact".into()));
    let execution = service
        .trigger_workflow_execution(&webhook, APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn missing_mandatory_variable_fails_validation() {
    let harness = TestHarness::new();
    let mut definition = workflow("wf-1");
    definition.variables = vec![Variable::mandatory("release")];
    harness.definitions.add_workflow(definition);

    let err = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::Validation(message) if message.contains("release")));
}

fn parameterized_args(build_no: Option<&str>) -> ExecutionArgs {
    let mut parameters = BTreeMap::new();
    if let Some(build_no) = build_no {
        parameters.insert("build_no".to_string(), build_no.to_string());
    }
    ExecutionArgs {
        artifact_variables: vec![ArtifactVariable {
            name: "image".into(),
            artifact_stream_id: "docker".into(),
            parameters,
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn parameterized_artifacts_are_prepared_in_the_background() {
    let harness = TestHarness::new();
    harness.definitions.add_workflow(workflow("wf-1"));

    let execution = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", parameterized_args(Some("42")))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Preparing);

    harness
        .service
        .admission()
        .wait_for_preparation(execution.uuid)
        .await
        .unwrap();

    let stored = harness.load(execution.uuid).await;
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.args.artifact_ids(), vec!["docker-42".to_string()]);
    assert!(stored.args.artifact_variables.is_empty());
}

#[tokio::test]
async fn failed_preparation_short_circuits_to_failed() {
    let harness = TestHarness::new();
    harness.definitions.add_workflow(workflow("wf-1"));

    let execution = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", parameterized_args(None))
        .await
        .unwrap();
    harness
        .service
        .admission()
        .wait_for_preparation(execution.uuid)
        .await
        .unwrap();

    let stored = harness.load(execution.uuid).await;
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert!(stored.rejection_reason.is_some());
    assert!(!harness.runtime.started().contains(&execution.uuid));
}

#[tokio::test]
async fn concurrency_limited_executions_wait_for_a_permit() {
    let harness = TestHarness::new();
    let mut definition = workflow("wf-1");
    definition.concurrency_strategy = Some(ConcurrencyStrategy {
        resource_name: "Queue".into(),
        unit: "infra-1".into(),
        capacity: 1,
        holding_scope: HoldingScope::Workflow,
    });
    harness.definitions.add_workflow(definition);

    let first = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap();
    let second = harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Running);
    assert_eq!(second.status, ExecutionStatus::Waiting);

    let waiting = harness
        .service
        .list_waiting_on_deployments(APP_ID, first.uuid)
        .await
        .unwrap();
    assert_eq!(waiting.iter().map(|e| e.uuid).collect::<Vec<_>>(), vec![second.uuid]);

    harness
        .service
        .execution_status_updated(APP_ID, first.uuid, ExecutionStatus::Success)
        .await
        .unwrap();

    assert_eq!(harness.load(second.uuid).await.status, ExecutionStatus::Running);
    assert!(harness.runtime.started().contains(&second.uuid));
}

async fn trigger_wf_1(harness: &TestHarness) -> tasker_deploy::models::WorkflowExecution {
    harness
        .service
        .trigger_workflow_execution(&caller(), APP_ID, "wf-1", ExecutionArgs::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn aborting_a_waiting_execution_gives_up_its_place_in_line() {
    let harness = TestHarness::new();
    let mut definition = workflow("wf-1");
    definition.concurrency_strategy = Some(ConcurrencyStrategy {
        resource_name: "Queue".into(),
        unit: "infra-1".into(),
        capacity: 1,
        holding_scope: HoldingScope::Workflow,
    });
    harness.definitions.add_workflow(definition);

    let first = trigger_wf_1(&harness).await;
    let second = trigger_wf_1(&harness).await;
    assert_eq!(second.status, ExecutionStatus::Waiting);

    let receipt = harness
        .service
        .issue_interrupt(
            &caller(),
            ExecutionInterrupt::new(APP_ID, second.uuid, ExecutionInterruptType::AbortAll),
        )
        .await
        .unwrap();
    assert!(receipt.finalized);
    assert_eq!(harness.load(second.uuid).await.status, ExecutionStatus::Aborted);

    harness
        .service
        .execution_status_updated(APP_ID, first.uuid, ExecutionStatus::Success)
        .await
        .unwrap();

    let third = trigger_wf_1(&harness).await;
    assert_eq!(third.status, ExecutionStatus::Running);
    assert!(!harness.runtime.started().contains(&second.uuid));
    assert!(harness.runtime.started().contains(&third.uuid));
}

#[tokio::test]
async fn pipeline_trigger_snapshots_the_definition() {
    let harness = TestHarness::new();
    harness.definitions.add_workflow(workflow("wf-qa"));
    harness.definitions.add_workflow(workflow("wf-prod"));
    harness.definitions.add_pipeline(pipeline(
        "pl-1",
        vec![
            env_element("QA", "wf-qa"),
            approval_element("Approve"),
            env_element("Prod", "wf-prod"),
        ],
    ));

    let execution = harness
        .service
        .trigger_pipeline_execution(&caller(), APP_ID, "pl-1", ExecutionArgs::default())
        .await
        .unwrap();

    assert!(execution.is_pipeline());
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.total, 2);
    assert_eq!(execution.service_ids, vec!["svc-1".to_string()]);
    let snapshot = execution.pipeline_execution.as_ref().unwrap();
    assert_eq!(snapshot.pipeline.element_count(), 3);

    let listed = harness
        .store
        .query_executions(&ExecutionQuery::for_app(APP_ID).workflow("pl-1"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}
