//! Declarative workflow and pipeline definitions consumed by the orchestrator.
//!
//! These are owned by an external CRUD layer; the orchestrator only reads them
//! through [`crate::services::DefinitionRepository`] and snapshots pipelines into
//! the executions it creates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::{DeploymentType, OrchestrationWorkflowType, StageElementType, StateType};

/// User-facing variable declared on a workflow or pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    /// Fixed variables always take the declared value
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub default_value: Option<String>,
}

impl Variable {
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            fixed: false,
            default_value: None,
        }
    }

    pub fn mandatory(name: impl Into<String>) -> Self {
        Self {
            mandatory: true,
            ..Self::optional(name)
        }
    }
}

/// Scope of a resource-constraint permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    Workflow,
    Pipeline,
}

/// Concurrency limit applied to every execution of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyStrategy {
    pub resource_name: String,
    /// Unit the permit is counted against, normally the infrastructure id
    pub unit: String,
    pub capacity: u32,
    pub holding_scope: HoldingScope,
}

/// One step inside a workflow phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub uuid: String,
    pub name: String,
    pub state_type: StateType,
    #[serde(default)]
    pub user_group_ids: Vec<String>,
}

/// A deployment phase: the unit counted by breakdowns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub uuid: String,
    pub name: String,
    pub service_id: Option<String>,
    pub infra_definition_id: Option<String>,
    /// Number of hosts/instances this phase deploys
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

fn default_instance_count() -> u32 {
    1
}

/// Orchestration body of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationWorkflow {
    pub orchestration_type: OrchestrationWorkflowType,
    pub deployment_type: Option<DeploymentType>,
    #[serde(default)]
    pub pre_deployment_steps: Vec<StepDefinition>,
    #[serde(default)]
    pub phases: Vec<WorkflowPhase>,
    /// Rollback phases keyed by the phase they compensate
    #[serde(default)]
    pub rollback_phases: HashMap<String, WorkflowPhase>,
    #[serde(default)]
    pub post_deployment_steps: Vec<StepDefinition>,
}

/// A workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub uuid: String,
    pub app_id: String,
    pub account_id: String,
    pub name: String,
    pub orchestration: OrchestrationWorkflow,
    #[serde(default)]
    pub service_ids: Vec<String>,
    #[serde(default)]
    pub env_id: Option<String>,
    #[serde(default)]
    pub infra_definition_ids: Vec<String>,
    #[serde(default)]
    pub infra_mapping_ids: Vec<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub concurrency_strategy: Option<ConcurrencyStrategy>,
    /// Rolling workflows on the newer Kubernetes path report host counts themselves
    #[serde(default)]
    pub k8s_v2: bool,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl Workflow {
    /// Expected number of deployed units, the sum over phases
    pub fn expected_instance_count(&self) -> u32 {
        self.orchestration
            .phases
            .iter()
            .map(|phase| phase.instance_count)
            .sum()
    }

    pub fn is_rolling(&self) -> bool {
        self.orchestration.orchestration_type == OrchestrationWorkflowType::Rolling
    }
}

/// One declared element of a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStageElement {
    pub uuid: String,
    pub name: String,
    pub element_type: StageElementType,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Ordering among ENV_ROLLBACK_STATE rows
    #[serde(default)]
    pub parallel_index: u32,
    #[serde(default)]
    pub requires_runtime_inputs: bool,
    #[serde(default)]
    pub user_group_ids: Vec<String>,
    #[serde(default)]
    pub skip_condition: Option<String>,
}

impl PipelineStageElement {
    pub fn new(
        uuid: impl Into<String>,
        name: impl Into<String>,
        element_type: StageElementType,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            element_type,
            workflow_id: None,
            disabled: false,
            parallel_index: 0,
            requires_runtime_inputs: false,
            user_group_ids: Vec::new(),
            skip_condition: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// A pipeline stage; `parallel` joins it to the previous stage's group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    #[serde(default)]
    pub parallel: bool,
    pub elements: Vec<PipelineStageElement>,
}

/// Stage elements sharing one parallel group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup<'a> {
    pub group_index: u32,
    pub elements: Vec<&'a PipelineStageElement>,
}

/// A pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub uuid: String,
    pub app_id: String,
    pub account_id: String,
    pub name: String,
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    /// Average duration per stage keyed by element id (falling back to name)
    #[serde(default)]
    pub state_estimates: HashMap<String, i64>,
}

impl Pipeline {
    /// Elements in declaration order paired with their parallel group index
    pub fn elements_with_groups(&self) -> Vec<(u32, &PipelineStageElement)> {
        let mut group_index = 0u32;
        let mut out = Vec::new();
        for (position, stage) in self.stages.iter().enumerate() {
            if position > 0 && !stage.parallel {
                group_index += 1;
            }
            for element in &stage.elements {
                out.push((group_index, element));
            }
        }
        out
    }

    /// Contiguous parallel groups in declaration order
    pub fn parallel_groups(&self) -> Vec<ParallelGroup<'_>> {
        let mut groups: Vec<ParallelGroup<'_>> = Vec::new();
        for (group_index, element) in self.elements_with_groups() {
            match groups.last_mut() {
                Some(group) if group.group_index == group_index => group.elements.push(element),
                _ => groups.push(ParallelGroup {
                    group_index,
                    elements: vec![element],
                }),
            }
        }
        groups
    }

    pub fn element_count(&self) -> usize {
        self.stages.iter().map(|s| s.elements.len()).sum()
    }

    /// Estimate for an element, keyed by id and then by name
    pub fn estimate_for(&self, element: &PipelineStageElement) -> Option<i64> {
        self.state_estimates
            .get(&element.uuid)
            .or_else(|| self.state_estimates.get(&element.name))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, parallel: bool, elements: &[&str]) -> PipelineStage {
        PipelineStage {
            name: name.to_string(),
            parallel,
            elements: elements
                .iter()
                .map(|e| PipelineStageElement::new(format!("{e}-id"), *e, StageElementType::EnvState))
                .collect(),
        }
    }

    fn pipeline(stages: Vec<PipelineStage>) -> Pipeline {
        Pipeline {
            uuid: "p1".into(),
            app_id: "app".into(),
            account_id: "acc".into(),
            name: "pipe".into(),
            stages,
            variables: vec![],
            state_estimates: HashMap::new(),
        }
    }

    #[test]
    fn parallel_stages_share_a_group() {
        let p = pipeline(vec![
            stage("dev", false, &["a"]),
            stage("qa", true, &["b"]),
            stage("prod", false, &["c"]),
        ]);
        let groups = p.parallel_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].elements.len(), 2);
        assert_eq!(groups[1].group_index, 1);
    }

    #[test]
    fn estimates_fall_back_to_name() {
        let mut p = pipeline(vec![stage("dev", false, &["a"])]);
        p.state_estimates.insert("a".into(), 1500);
        let element = &p.stages[0].elements[0];
        assert_eq!(p.estimate_for(element), Some(1500));
    }
}
