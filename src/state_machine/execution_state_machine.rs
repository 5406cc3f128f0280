use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::{
    actions::{PublishTransitionEventAction, StateAction},
    errors::{StateMachineError, StateMachineResult},
    events::ExecutionEvent,
    guards::{ArtifactsResolvedGuard, RejectionReasonGuard, StateGuard},
    states::ExecutionStatus,
};
use crate::events::EventPublisher;
use crate::models::WorkflowExecution;
use crate::store::{ExecutionStore, ExecutionUpdate};

/// Lifecycle manager for the status of a workflow execution.
///
/// Every status change made by the orchestrator itself (admission, preparation,
/// permit queueing, pre-runtime aborts and runtime status callbacks) goes through
/// here so that final statuses stay final.
pub struct ExecutionStateMachine {
    store: Arc<dyn ExecutionStore>,
    event_publisher: Arc<EventPublisher>,
}

impl ExecutionStateMachine {
    pub fn new(store: Arc<dyn ExecutionStore>, event_publisher: Arc<EventPublisher>) -> Self {
        Self {
            store,
            event_publisher,
        }
    }

    /// Attempt to transition the execution, updating the passed snapshot on success
    pub async fn transition(
        &self,
        execution: &mut WorkflowExecution,
        event: ExecutionEvent,
    ) -> StateMachineResult<ExecutionStatus> {
        let current_state = execution.status;
        let target_state = Self::determine_target_state(execution, &event)?;

        if let Some(reason) = event.reason() {
            execution.rejection_reason = Some(reason.to_string());
        }

        self.check_guards(execution, current_state, target_state, &event)
            .await?;

        let now = Utc::now();
        let mut update = ExecutionUpdate::status(target_state);
        if matches!(target_state, ExecutionStatus::Running) {
            update = update.with_started_at(now);
        }
        if target_state.is_final() {
            update = update.with_ended_at(now);
        }
        if let Some(reason) = event.reason() {
            update = update.with_rejection_reason(reason);
        }

        let Some(revision) = self.store.update_execution(execution.uuid, &update).await? else {
            return Err(StateMachineError::NotFound(execution.uuid));
        };
        update.apply(execution);
        execution.revision = revision;

        debug!(
            execution_uuid = %execution.uuid,
            from = %current_state,
            to = %target_state,
            event = event.event_type(),
            "Execution status transition"
        );

        self.execute_actions(execution, current_state, target_state, &event)
            .await;

        Ok(target_state)
    }

    /// Determine the target status based on current status and event
    pub fn determine_target_state(
        execution: &WorkflowExecution,
        event: &ExecutionEvent,
    ) -> StateMachineResult<ExecutionStatus> {
        let current_state = execution.status;
        if current_state.is_final() {
            return Err(StateMachineError::AlreadyFinal {
                execution_uuid: execution.uuid,
                status: current_state,
            });
        }

        let target = match (current_state, event) {
            // Admission
            (ExecutionStatus::New, ExecutionEvent::Prepare) => ExecutionStatus::Preparing,
            (ExecutionStatus::New, ExecutionEvent::Queue) => ExecutionStatus::Queued,
            (ExecutionStatus::New, ExecutionEvent::Reject(_)) => ExecutionStatus::Rejected,

            // Artifact preparation
            (ExecutionStatus::Preparing, ExecutionEvent::PreparationSucceeded) => {
                ExecutionStatus::Queued
            }
            (ExecutionStatus::Preparing, ExecutionEvent::PreparationFailed(_)) => {
                ExecutionStatus::Failed
            }

            // Runtime start and permit queueing
            (ExecutionStatus::Queued, ExecutionEvent::Start) => ExecutionStatus::Running,
            (ExecutionStatus::Queued, ExecutionEvent::AwaitPermit) => ExecutionStatus::Waiting,
            (ExecutionStatus::Waiting, ExecutionEvent::PermitGranted) => ExecutionStatus::Running,
            (ExecutionStatus::Waiting, ExecutionEvent::Start) => ExecutionStatus::Running,

            // Abort is legal from every non-final status
            (_, ExecutionEvent::Abort) => ExecutionStatus::Aborted,

            // Runtime-reported statuses once the runtime owns the execution
            (from, ExecutionEvent::Report(reported))
                if !matches!(from, ExecutionStatus::New | ExecutionStatus::Preparing)
                    && *reported != ExecutionStatus::New
                    && *reported != ExecutionStatus::Preparing =>
            {
                *reported
            }

            // Invalid transitions
            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state,
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Check guard conditions for the transition
    async fn check_guards(
        &self,
        execution: &WorkflowExecution,
        current_state: ExecutionStatus,
        target_state: ExecutionStatus,
        event: &ExecutionEvent,
    ) -> StateMachineResult<()> {
        match (current_state, target_state, event) {
            (ExecutionStatus::Preparing, ExecutionStatus::Queued, _) => {
                ArtifactsResolvedGuard.check(execution).await?;
            }
            (_, ExecutionStatus::Rejected, ExecutionEvent::Reject(_)) => {
                RejectionReasonGuard.check(execution).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Execute actions after successful transition
    async fn execute_actions(
        &self,
        execution: &WorkflowExecution,
        from_state: ExecutionStatus,
        to_state: ExecutionStatus,
        event: &ExecutionEvent,
    ) {
        let action = PublishTransitionEventAction::new(self.event_publisher.clone());
        action
            .execute(execution, from_state, to_state, event.event_type())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WorkflowType;
    use crate::models::ExecutionArgs;
    use crate::store::InMemoryExecutionStore;

    fn execution(status: ExecutionStatus) -> WorkflowExecution {
        let mut exec = WorkflowExecution::new(
            "app",
            "acc",
            "wf",
            "deploy",
            WorkflowType::Orchestration,
            ExecutionArgs::default(),
        );
        exec.status = status;
        exec
    }

    #[test]
    fn admission_transitions() {
        let exec = execution(ExecutionStatus::New);
        assert_eq!(
            ExecutionStateMachine::determine_target_state(&exec, &ExecutionEvent::Prepare).unwrap(),
            ExecutionStatus::Preparing
        );
        assert_eq!(
            ExecutionStateMachine::determine_target_state(&exec, &ExecutionEvent::Queue).unwrap(),
            ExecutionStatus::Queued
        );
        assert!(
            ExecutionStateMachine::determine_target_state(&exec, &ExecutionEvent::Start).is_err()
        );
    }

    #[test]
    fn final_statuses_reject_every_event() {
        let exec = execution(ExecutionStatus::Success);
        let result = ExecutionStateMachine::determine_target_state(&exec, &ExecutionEvent::Abort);
        assert!(matches!(result, Err(StateMachineError::AlreadyFinal { .. })));
    }

    #[test]
    fn runtime_cannot_report_while_preparing() {
        let exec = execution(ExecutionStatus::Preparing);
        assert!(ExecutionStateMachine::determine_target_state(
            &exec,
            &ExecutionEvent::Report(ExecutionStatus::Running)
        )
        .is_err());
        assert_eq!(
            ExecutionStateMachine::determine_target_state(&exec, &ExecutionEvent::Abort).unwrap(),
            ExecutionStatus::Aborted
        );
    }

    #[tokio::test]
    async fn transition_persists_and_stamps_end_time() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let machine = ExecutionStateMachine::new(store.clone(), Arc::new(EventPublisher::default()));
        let mut exec = store
            .save_execution(&execution(ExecutionStatus::Queued))
            .await
            .unwrap();

        machine.transition(&mut exec, ExecutionEvent::Start).await.unwrap();
        machine
            .transition(&mut exec, ExecutionEvent::Report(ExecutionStatus::Success))
            .await
            .unwrap();

        let stored = store.get_execution("app", exec.uuid).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert!(stored.started_at.is_some());
        assert!(stored.ended_at.is_some());
    }

    #[tokio::test]
    async fn rejection_records_reason() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let machine = ExecutionStateMachine::new(store.clone(), Arc::new(EventPublisher::default()));
        let mut exec = store
            .save_execution(&execution(ExecutionStatus::New))
            .await
            .unwrap();

        machine
            .transition(&mut exec, ExecutionEvent::Reject("freeze fw-1".into()))
            .await
            .unwrap();
        let stored = store.get_execution("app", exec.uuid).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("freeze fw-1"));
    }
}
