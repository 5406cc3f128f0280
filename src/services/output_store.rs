//! Scoped key/value blobs passed between stages.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::DeployResult;

/// Where an output lives; unset fields widen the scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputScope {
    pub app_id: String,
    pub pipeline_execution_id: Option<Uuid>,
    pub workflow_execution_ids: Vec<Uuid>,
    pub phase_execution_id: Option<String>,
    pub state_execution_id: Option<Uuid>,
}

impl OutputScope {
    pub fn pipeline(app_id: impl Into<String>, pipeline_execution_id: Uuid) -> Self {
        Self {
            app_id: app_id.into(),
            pipeline_execution_id: Some(pipeline_execution_id),
            ..Self::default()
        }
    }

    pub fn workflow(app_id: impl Into<String>, workflow_execution_id: Uuid) -> Self {
        Self {
            app_id: app_id.into(),
            workflow_execution_ids: vec![workflow_execution_id],
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait OutputVariableStore: std::fmt::Debug + Send + Sync + 'static {
    async fn put(&self, scope: &OutputScope, name: &str, value: Value) -> DeployResult<()>;
    async fn get(&self, scope: &OutputScope, name: &str) -> DeployResult<Option<Value>>;
}

#[derive(Debug, Default)]
pub struct InMemoryOutputStore {
    values: DashMap<(OutputScope, String), Value>,
}

impl InMemoryOutputStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutputVariableStore for InMemoryOutputStore {
    async fn put(&self, scope: &OutputScope, name: &str, value: Value) -> DeployResult<()> {
        self.values.insert((scope.clone(), name.to_string()), value);
        Ok(())
    }

    async fn get(&self, scope: &OutputScope, name: &str) -> DeployResult<Option<Value>> {
        Ok(self
            .values
            .get(&(scope.clone(), name.to_string()))
            .map(|v| v.value().clone()))
    }
}
