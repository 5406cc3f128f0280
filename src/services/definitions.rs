//! Read-only access to workflow and pipeline definitions, plus the artifact
//! resolver used during preparation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

use crate::errors::{DeployError, DeployResult};
use crate::models::{Artifact, ArtifactVariable, Pipeline, Workflow};

#[async_trait]
pub trait DefinitionRepository: std::fmt::Debug + Send + Sync + 'static {
    async fn get_workflow(&self, app_id: &str, workflow_id: &str) -> DeployResult<Option<Workflow>>;
    async fn get_pipeline(&self, app_id: &str, pipeline_id: &str) -> DeployResult<Option<Pipeline>>;
    /// Store refreshed per-stage duration estimates (milliseconds)
    async fn update_stage_estimates(
        &self,
        app_id: &str,
        pipeline_id: &str,
        estimates: HashMap<String, i64>,
    ) -> DeployResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryDefinitionRepository {
    workflows: DashMap<(String, String), Workflow>,
    pipelines: DashMap<(String, String), Pipeline>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workflow(&self, workflow: Workflow) {
        self.workflows
            .insert((workflow.app_id.clone(), workflow.uuid.clone()), workflow);
    }

    pub fn add_pipeline(&self, pipeline: Pipeline) {
        self.pipelines
            .insert((pipeline.app_id.clone(), pipeline.uuid.clone()), pipeline);
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn get_workflow(&self, app_id: &str, workflow_id: &str) -> DeployResult<Option<Workflow>> {
        Ok(self
            .workflows
            .get(&(app_id.to_string(), workflow_id.to_string()))
            .map(|w| w.value().clone()))
    }

    async fn get_pipeline(&self, app_id: &str, pipeline_id: &str) -> DeployResult<Option<Pipeline>> {
        Ok(self
            .pipelines
            .get(&(app_id.to_string(), pipeline_id.to_string()))
            .map(|p| p.value().clone()))
    }

    async fn update_stage_estimates(
        &self,
        app_id: &str,
        pipeline_id: &str,
        estimates: HashMap<String, i64>,
    ) -> DeployResult<()> {
        let mut pipeline = self
            .pipelines
            .get_mut(&(app_id.to_string(), pipeline_id.to_string()))
            .ok_or_else(|| DeployError::NotFound(format!("Pipeline {pipeline_id} not found")))?;
        pipeline.state_estimates = estimates;
        Ok(())
    }
}

/// Resolves parameterized artifact sources into concrete artifacts
#[async_trait]
pub trait ArtifactResolver: std::fmt::Debug + Send + Sync + 'static {
    async fn resolve(
        &self,
        account_id: &str,
        variables: &[ArtifactVariable],
    ) -> DeployResult<Vec<Artifact>>;
}

/// Resolves each variable to a build named by its `build_no` parameter
#[derive(Debug, Default, Clone, Copy)]
pub struct ParameterArtifactResolver;

#[async_trait]
impl ArtifactResolver for ParameterArtifactResolver {
    async fn resolve(
        &self,
        _account_id: &str,
        variables: &[ArtifactVariable],
    ) -> DeployResult<Vec<Artifact>> {
        variables
            .iter()
            .map(|variable| {
                let build_no = variable.parameters.get("build_no").ok_or_else(|| {
                    DeployError::Validation(format!(
                        "Artifact variable {} has no build_no parameter",
                        variable.name
                    ))
                })?;
                Ok(Artifact::new(
                    format!("{}-{}", variable.artifact_stream_id, build_no),
                    variable.artifact_stream_id.clone(),
                    build_no.clone(),
                ))
            })
            .collect()
    }
}
