use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{ExecutionQuery, ExecutionStore, ExecutionUpdate, StateInstanceQuery};
use crate::errors::{StoreError, StoreResult};
use crate::models::{
    ExecutionInterrupt, PipelineExecution, StateExecutionInstance, WorkflowExecution,
    WorkflowTree,
};

/// Process-local store backed by concurrent maps
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    clock: AtomicU64,
    executions: DashMap<Uuid, WorkflowExecution>,
    state_instances: DashMap<Uuid, StateExecutionInstance>,
    interrupts: DashMap<Uuid, Vec<ExecutionInterrupt>>,
    trees: DashMap<Uuid, WorkflowTree>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> StoreResult<WorkflowExecution> {
        let mut stored = execution.clone();
        stored.revision = self.tick();
        self.executions.insert(stored.uuid, stored.clone());
        Ok(stored)
    }

    async fn get_execution(
        &self,
        app_id: &str,
        uuid: Uuid,
    ) -> StoreResult<Option<WorkflowExecution>> {
        Ok(self
            .executions
            .get(&uuid)
            .filter(|e| e.app_id == app_id)
            .map(|e| e.value().clone()))
    }

    async fn update_execution(
        &self,
        uuid: Uuid,
        update: &ExecutionUpdate,
    ) -> StoreResult<Option<u64>> {
        match self.executions.get_mut(&uuid) {
            Some(mut entry) => {
                update.apply(&mut entry);
                entry.revision = self.tick();
                Ok(Some(entry.revision))
            }
            None => Ok(None),
        }
    }

    async fn update_pipeline_execution(
        &self,
        uuid: Uuid,
        expected_revision: u64,
        pipeline_execution: &PipelineExecution,
    ) -> StoreResult<Option<u64>> {
        let Some(mut entry) = self.executions.get_mut(&uuid) else {
            return Ok(None);
        };
        if entry.revision != expected_revision {
            return Err(StoreError::ConcurrentModification {
                entity: "workflow_execution",
                id: uuid.to_string(),
            });
        }
        entry.pipeline_execution = Some(pipeline_execution.clone());
        entry.revision = self.tick();
        Ok(Some(entry.revision))
    }

    async fn query_executions(
        &self,
        query: &ExecutionQuery,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let mut found: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.revision.cmp(&a.revision)));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn save_state_instance(
        &self,
        instance: &StateExecutionInstance,
    ) -> StoreResult<StateExecutionInstance> {
        let mut stored = instance.clone();
        stored.revision = self.tick();
        self.state_instances.insert(stored.uuid, stored.clone());
        Ok(stored)
    }

    async fn get_state_instance(&self, uuid: Uuid) -> StoreResult<Option<StateExecutionInstance>> {
        Ok(self.state_instances.get(&uuid).map(|i| i.value().clone()))
    }

    async fn find_state_instances(
        &self,
        query: &StateInstanceQuery,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        let mut found: Vec<StateExecutionInstance> = self
            .state_instances
            .iter()
            .filter(|i| query.matches(i.value()))
            .map(|i| i.value().clone())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.revision.cmp(&b.revision)));
        Ok(found)
    }

    async fn max_state_revision(&self, execution_uuid: Uuid) -> StoreResult<u64> {
        Ok(self
            .state_instances
            .iter()
            .filter(|i| i.execution_uuid == execution_uuid)
            .map(|i| i.revision)
            .max()
            .unwrap_or(0))
    }

    async fn save_interrupt(&self, interrupt: &ExecutionInterrupt) -> StoreResult<()> {
        self.interrupts
            .entry(interrupt.execution_uuid)
            .or_default()
            .push(interrupt.clone());
        Ok(())
    }

    async fn list_interrupts(&self, execution_uuid: Uuid) -> StoreResult<Vec<ExecutionInterrupt>> {
        Ok(self
            .interrupts
            .get(&execution_uuid)
            .map(|list| list.value().clone())
            .unwrap_or_default())
    }

    async fn get_tree(&self, execution_uuid: Uuid) -> StoreResult<Option<WorkflowTree>> {
        let now = Utc::now();
        Ok(self
            .trees
            .get(&execution_uuid)
            .filter(|t| t.expires_at > now)
            .map(|t| t.value().clone()))
    }

    async fn upsert_tree(&self, tree: &WorkflowTree) -> StoreResult<()> {
        self.trees.insert(tree.execution_uuid, tree.clone());
        Ok(())
    }
}
