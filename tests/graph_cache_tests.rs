mod common;

use std::time::Duration;

use common::*;
use tasker_deploy::constants::{ExecutionInterruptType, ExecutionStatus, StateType};
use tasker_deploy::models::{ExecutionInterrupt, StateExecutionInstance, WorkflowTree};
use tasker_deploy::store::ExecutionStore;
use uuid::Uuid;

fn instance(execution_uuid: Uuid, name: &str, state_type: StateType) -> StateExecutionInstance {
    StateExecutionInstance::new(
        execution_uuid,
        APP_ID,
        ACCOUNT_ID,
        name,
        state_type,
        ExecutionStatus::Running,
    )
}

/// Wait until the stored tree reaches `context_order`
async fn stored_at(harness: &TestHarness, execution_uuid: Uuid, context_order: u64) -> WorkflowTree {
    for _ in 0..50 {
        if let Some(tree) = harness.store.get_tree(execution_uuid).await.unwrap() {
            if tree.context_order == context_order && !tree.was_invalidated {
                return tree;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tree for {execution_uuid} never reached {context_order}");
}

#[tokio::test]
async fn cached_tree_is_reused_until_the_watermark_moves() {
    let harness = TestHarness::new();
    let execution = harness
        .save(&workflow_execution(&workflow("wf-1"), ExecutionStatus::Running))
        .await;
    let phase = harness
        .save_instance(&instance(execution.uuid, "Phase 1", StateType::Phase))
        .await;
    harness
        .save_instance(&instance(execution.uuid, "Deploy", StateType::PhaseStep).with_parent(phase.uuid))
        .await;

    let first = harness
        .service
        .get_execution_graph(APP_ID, execution.uuid)
        .await
        .unwrap();
    assert_eq!(first.graph.node_count(), 2);
    assert_eq!(first.graph.roots.len(), 1);
    stored_at(&harness, execution.uuid, first.context_order).await;

    let reused = harness
        .service
        .get_execution_graph(APP_ID, execution.uuid)
        .await
        .unwrap();
    assert_eq!(reused.computed_at, first.computed_at);
    assert_eq!(reused.context_order, first.context_order);

    // A newer state instance raises the watermark past the cached tree
    harness
        .save_instance(&instance(execution.uuid, "Verify", StateType::PhaseStep).with_parent(phase.uuid))
        .await;
    let recomputed = harness
        .service
        .get_execution_graph(APP_ID, execution.uuid)
        .await
        .unwrap();
    assert!(recomputed.context_order > first.context_order);
    assert_eq!(recomputed.graph.node_count(), 3);
    assert_eq!(recomputed.graph.roots[0].children.len(), 2);
}

#[tokio::test]
async fn invalidation_forces_recompute() {
    let harness = TestHarness::new();
    let execution = harness
        .save(&workflow_execution(&workflow("wf-1"), ExecutionStatus::Running))
        .await;
    harness
        .save_instance(&instance(execution.uuid, "Phase 1", StateType::Phase))
        .await;

    let cache = harness.service.graph_cache();
    let first = cache.calculate_tree(execution.uuid).await.unwrap();
    stored_at(&harness, execution.uuid, first.context_order).await;

    cache
        .invalidate(execution.uuid, Some(ExecutionStatus::Pausing))
        .await
        .unwrap();
    let invalidated = harness.store.get_tree(execution.uuid).await.unwrap().unwrap();
    assert!(invalidated.was_invalidated);
    assert_eq!(invalidated.override_status, Some(ExecutionStatus::Pausing));
    assert!(invalidated.context_order < first.context_order);
    assert!(invalidated.expires_at < first.expires_at);

    let recomputed = cache.calculate_tree(execution.uuid).await.unwrap();
    assert!(!recomputed.was_invalidated);
    assert_eq!(recomputed.override_status, None);
    assert_eq!(recomputed.context_order, first.context_order);
    assert!(recomputed.computed_at >= first.computed_at);
    stored_at(&harness, execution.uuid, recomputed.context_order).await;
}

#[tokio::test]
async fn accepted_interrupts_invalidate_the_cached_tree() {
    let harness = TestHarness::new();
    let execution = harness
        .save(&workflow_execution(&workflow("wf-1"), ExecutionStatus::Running))
        .await;
    harness
        .save_instance(&instance(execution.uuid, "Phase 1", StateType::Phase))
        .await;

    let first = harness
        .service
        .get_execution_graph(APP_ID, execution.uuid)
        .await
        .unwrap();
    stored_at(&harness, execution.uuid, first.context_order).await;

    harness
        .service
        .issue_interrupt(
            &caller(),
            ExecutionInterrupt::new(APP_ID, execution.uuid, ExecutionInterruptType::PauseAll),
        )
        .await
        .unwrap();

    let stored = harness.store.get_tree(execution.uuid).await.unwrap().unwrap();
    assert!(stored.was_invalidated);
    assert_eq!(stored.override_status, Some(ExecutionStatus::Pausing));
}

#[tokio::test]
async fn invalidating_an_uncached_execution_is_a_no_op() {
    let harness = TestHarness::new();
    let execution_uuid = Uuid::new_v4();
    harness
        .service
        .graph_cache()
        .invalidate(execution_uuid, None)
        .await
        .unwrap();
    assert!(harness.store.get_tree(execution_uuid).await.unwrap().is_none());
}
