mod common;

use chrono::{Duration, Utc};
use common::*;
use tasker_deploy::constants::{events, ExecutionStatus};
use tasker_deploy::errors::DeployError;
use tasker_deploy::store::ExecutionQuery;
use uuid::Uuid;

#[tokio::test]
async fn last_good_artifacts_come_from_the_newest_success() {
    let harness = TestHarness::new();
    let definition = workflow("wf-1");

    let mut older = with_artifacts(workflow_execution(&definition, ExecutionStatus::Success), &["artifact-1"]);
    older.created_at = Utc::now() - Duration::minutes(30);
    older.infra_mapping_ids = vec!["im-2".into()];
    harness.save(&older).await;

    let mut newer = with_artifacts(workflow_execution(&definition, ExecutionStatus::Success), &["artifact-2"]);
    newer.created_at = Utc::now() - Duration::minutes(10);
    harness.save(&newer).await;

    let mut failed = with_artifacts(workflow_execution(&definition, ExecutionStatus::Failed), &["artifact-3"]);
    failed.created_at = Utc::now();
    harness.save(&failed).await;

    let latest = harness
        .service
        .obtain_last_good_deployed_artifacts(APP_ID, "wf-1", &[])
        .await
        .unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].uuid, "artifact-2");

    let scoped = harness
        .service
        .obtain_last_good_deployed_artifacts(APP_ID, "wf-1", &["im-2".to_string()])
        .await
        .unwrap();
    assert_eq!(scoped[0].uuid, "artifact-1");

    let none = harness
        .service
        .obtain_last_good_deployed_artifacts(APP_ID, "wf-unknown", &[])
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn listing_skips_records_that_fail_to_refresh() {
    let harness = TestHarness::new();
    let known = workflow("wf-1");
    harness.definitions.add_workflow(known.clone());
    let listed_run = harness
        .save(&workflow_execution(&known, ExecutionStatus::Running))
        .await;
    // No definition registered, so its breakdown cannot be computed
    harness
        .save(&workflow_execution(&workflow("wf-orphan"), ExecutionStatus::Running))
        .await;

    let listed = harness
        .service
        .list_executions(None, &ExecutionQuery::for_app(APP_ID))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].uuid, listed_run.uuid);
    assert!(listed[0].breakdown.is_some());
}

#[tokio::test]
async fn details_fall_back_to_the_stored_record() {
    let harness = TestHarness::new();
    let orphan = harness
        .save(&workflow_execution(&workflow("wf-orphan"), ExecutionStatus::Running))
        .await;

    let details = harness
        .service
        .get_execution_details(Some(&caller()), APP_ID, orphan.uuid)
        .await
        .unwrap();
    assert_eq!(details.uuid, orphan.uuid);
    assert!(details.breakdown.is_none());

    let err = harness
        .service
        .get_execution_details(None, APP_ID, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));

    // Executions are scoped to their application
    let err = harness
        .service
        .get_execution_details(None, "other-app", orphan.uuid)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
}

#[tokio::test]
async fn completion_is_published_for_the_execution() {
    let harness = TestHarness::new();
    let definition = workflow("wf-1");
    harness.definitions.add_workflow(definition.clone());
    let execution = harness
        .save(&workflow_execution(&definition, ExecutionStatus::Running))
        .await;
    let mut watch = harness.context.event_publisher.watch_execution(execution.uuid);

    harness
        .service
        .execution_status_updated(APP_ID, execution.uuid, ExecutionStatus::Success)
        .await
        .unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), watch.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, events::EXECUTION_COMPLETED);
    assert_eq!(event.execution_uuid, Some(execution.uuid));
}

#[tokio::test]
async fn shutdown_stops_the_cascade_worker() {
    let harness = TestHarness::new();
    harness.service.shutdown().await.unwrap();
}
