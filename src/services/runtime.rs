//! State machine runtime seam.
//!
//! The runtime advances state nodes and reports status changes back through the
//! orchestrator's callbacks. `InProcessRuntime` records what it was handed and
//! applies top-level interrupts to the stored execution, which is enough to
//! embed the orchestrator without a real runtime behind it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::constants::{ExecutionInterruptType, ExecutionStatus};
use crate::errors::{DeployError, DeployResult};
use crate::models::{ExecutionInterrupt, WorkflowExecution};
use crate::state_machine::StateMachine;
use crate::store::{ExecutionStore, ExecutionUpdate};

/// Handle to a state machine queued on the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHandle {
    pub execution_uuid: Uuid,
    pub root_instance_id: Uuid,
}

#[async_trait]
pub trait StateMachineRuntime: Send + Sync + 'static {
    /// Queue a state machine for the execution, returning its root handle
    async fn queue(
        &self,
        machine: &StateMachine,
        execution: &WorkflowExecution,
    ) -> DeployResult<RuntimeHandle>;

    /// Begin advancing a queued state machine
    async fn start_execution(
        &self,
        machine: &StateMachine,
        handle: &RuntimeHandle,
    ) -> DeployResult<()>;

    /// Hand an accepted interrupt to the runtime for consumption
    async fn register_interrupt(&self, interrupt: &ExecutionInterrupt) -> DeployResult<()>;
}

#[derive(Debug, Default)]
pub struct InProcessRuntime {
    store: Option<Arc<dyn ExecutionStore>>,
    queued: DashMap<Uuid, (StateMachine, RuntimeHandle)>,
    started: Mutex<Vec<Uuid>>,
    interrupts: Mutex<Vec<ExecutionInterrupt>>,
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply top-level interrupts to executions in this store
    pub fn with_store(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    pub fn queued_machine(&self, execution_uuid: Uuid) -> Option<StateMachine> {
        self.queued.get(&execution_uuid).map(|e| e.value().0.clone())
    }

    pub fn started(&self) -> Vec<Uuid> {
        self.started.lock().clone()
    }

    pub fn interrupts(&self) -> Vec<ExecutionInterrupt> {
        self.interrupts.lock().clone()
    }

    async fn apply_interrupt(&self, interrupt: &ExecutionInterrupt) -> DeployResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let target = match interrupt.interrupt_type {
            ExecutionInterruptType::AbortAll => ExecutionStatus::Aborted,
            ExecutionInterruptType::PauseAll => ExecutionStatus::Paused,
            ExecutionInterruptType::ResumeAll => ExecutionStatus::Running,
            _ => return Ok(()),
        };
        let Some(execution) = store
            .get_execution(&interrupt.app_id, interrupt.execution_uuid)
            .await?
        else {
            return Err(DeployError::NotFound(format!(
                "Execution {} not found",
                interrupt.execution_uuid
            )));
        };
        if execution.status.is_final() {
            return Ok(());
        }
        let mut update = ExecutionUpdate::status(target);
        if target.is_final() {
            update = update.with_ended_at(chrono::Utc::now());
        }
        store.update_execution(execution.uuid, &update).await?;
        Ok(())
    }
}

#[async_trait]
impl StateMachineRuntime for InProcessRuntime {
    async fn queue(
        &self,
        machine: &StateMachine,
        execution: &WorkflowExecution,
    ) -> DeployResult<RuntimeHandle> {
        let handle = RuntimeHandle {
            execution_uuid: execution.uuid,
            root_instance_id: Uuid::new_v4(),
        };
        self.queued
            .insert(execution.uuid, (machine.clone(), handle.clone()));
        debug!(execution_uuid = %execution.uuid, states = machine.nodes.len(), "State machine queued");
        Ok(handle)
    }

    async fn start_execution(
        &self,
        _machine: &StateMachine,
        handle: &RuntimeHandle,
    ) -> DeployResult<()> {
        self.started.lock().push(handle.execution_uuid);
        Ok(())
    }

    async fn register_interrupt(&self, interrupt: &ExecutionInterrupt) -> DeployResult<()> {
        self.interrupts.lock().push(interrupt.clone());
        self.apply_interrupt(interrupt).await
    }
}
