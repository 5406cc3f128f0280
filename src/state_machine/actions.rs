use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::states::ExecutionStatus;
use crate::constants::events;
use crate::events::EventPublisher;
use crate::models::WorkflowExecution;

/// Trait for implementing state transition actions
#[async_trait]
pub trait StateAction<T>: Send + Sync {
    /// Execute the action; failures are logged by the caller, never propagated
    async fn execute(&self, entity: &T, from_state: ExecutionStatus, to_state: ExecutionStatus, event: &str);

    /// Get a description of this action for logging
    fn description(&self) -> &'static str;
}

/// Publishes status-change and completion events
pub struct PublishTransitionEventAction {
    event_publisher: Arc<EventPublisher>,
}

impl PublishTransitionEventAction {
    pub fn new(event_publisher: Arc<EventPublisher>) -> Self {
        Self { event_publisher }
    }
}

#[async_trait]
impl StateAction<WorkflowExecution> for PublishTransitionEventAction {
    async fn execute(
        &self,
        execution: &WorkflowExecution,
        from_state: ExecutionStatus,
        to_state: ExecutionStatus,
        event: &str,
    ) {
        let event_name = if to_state == ExecutionStatus::Rejected {
            events::EXECUTION_REJECTED
        } else if to_state.is_final() {
            events::EXECUTION_COMPLETED
        } else {
            events::EXECUTION_STATUS_CHANGED
        };

        let context = json!({
            "execution_uuid": execution.uuid,
            "app_id": execution.app_id,
            "workflow_id": execution.workflow_id,
            "workflow_type": execution.workflow_type,
            "from_state": from_state,
            "to_state": to_state,
            "event": event,
        });

        if let Err(e) = self.event_publisher.publish(event_name, context).await {
            tracing::warn!(
                execution_uuid = %execution.uuid,
                event_name = event_name,
                error = %e,
                "Failed to publish transition event"
            );
        }
    }

    fn description(&self) -> &'static str {
        "Publish lifecycle event for execution transition"
    }
}
