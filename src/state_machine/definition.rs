//! In-memory state machine definitions built from workflow and pipeline
//! definitions. The runtime executes these; the orchestrator also replays them
//! to project progress breakdowns.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{StageElementType, StateType};
use crate::errors::{DeployError, DeployResult};
use crate::models::{Pipeline, StepDefinition, Workflow, WorkflowPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub kind: TransitionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNode {
    pub name: String,
    pub state_type: StateType,
    /// Definition element (phase, step or stage element) the node came from
    pub element_id: Option<String>,
    /// Units this node contributes to a breakdown; 0 for bookkeeping states
    pub weight: u32,
    pub rollback: bool,
    pub parallel_group: Option<u32>,
}

impl StateNode {
    fn new(name: impl Into<String>, state_type: StateType, weight: u32) -> Self {
        Self {
            name: name.into(),
            state_type,
            element_id: None,
            weight,
            rollback: false,
            parallel_group: None,
        }
    }

    fn from_step(step: &StepDefinition) -> Self {
        Self {
            element_id: Some(step.uuid.clone()),
            ..Self::new(step.name.clone(), step.state_type, 0)
        }
    }

    fn from_phase(phase: &WorkflowPhase, rollback: bool) -> Self {
        Self {
            element_id: Some(phase.uuid.clone()),
            rollback,
            ..Self::new(phase.name.clone(), StateType::Phase, phase.instance_count)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    pub uuid: Uuid,
    /// Workflow or pipeline id this machine was generated from
    pub origin_id: String,
    pub nodes: Vec<StateNode>,
    pub transitions: Vec<Transition>,
    pub initial_state: Option<String>,
    /// Generated for an on-demand rollback
    pub rollback: bool,
}

/// Name of the queueing state inserted for concurrency-limited workflows
pub const RESOURCE_CONSTRAINT_STATE: &str = "Resource Constraint";

impl StateMachine {
    fn empty(origin_id: &str, rollback: bool) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            origin_id: origin_id.to_string(),
            nodes: Vec::new(),
            transitions: Vec::new(),
            initial_state: None,
            rollback,
        }
    }

    fn push_chained(&mut self, node: StateNode) {
        if let Some(last) = self.nodes.iter().rev().find(|n| n.rollback == node.rollback) {
            self.transitions.push(Transition {
                from: last.name.clone(),
                to: node.name.clone(),
                kind: TransitionKind::Success,
            });
        }
        if self.initial_state.is_none() {
            self.initial_state = Some(node.name.clone());
        }
        self.nodes.push(node);
    }

    /// Build the forward state machine of a workflow
    pub fn from_workflow(workflow: &Workflow) -> DeployResult<Self> {
        if !workflow.valid {
            return Err(DeployError::Validation(format!(
                "Workflow {} is not valid and cannot be executed",
                workflow.name
            )));
        }
        if workflow.orchestration.phases.is_empty() {
            return Err(DeployError::Validation(format!(
                "Workflow {} has no deployment phases",
                workflow.name
            )));
        }

        let mut machine = Self::empty(&workflow.uuid, false);

        if let Some(strategy) = &workflow.concurrency_strategy {
            let mut node = StateNode::new(RESOURCE_CONSTRAINT_STATE, StateType::ResourceConstraint, 0);
            node.element_id = Some(strategy.resource_name.clone());
            machine.push_chained(node);
        }
        for step in &workflow.orchestration.pre_deployment_steps {
            machine.push_chained(StateNode::from_step(step));
        }
        for phase in &workflow.orchestration.phases {
            machine.push_chained(StateNode::from_phase(phase, false));
        }
        for step in &workflow.orchestration.post_deployment_steps {
            machine.push_chained(StateNode::from_step(step));
        }

        // Each phase fails over to its own rollback phase when one is declared
        for phase in &workflow.orchestration.phases {
            if let Some(rollback_phase) = workflow.orchestration.rollback_phases.get(&phase.uuid) {
                let node = StateNode::from_phase(rollback_phase, true);
                machine.transitions.push(Transition {
                    from: phase.name.clone(),
                    to: node.name.clone(),
                    kind: TransitionKind::Failure,
                });
                machine.nodes.push(node);
            }
        }

        Ok(machine)
    }

    /// Build the compensating state machine used by on-demand rollback
    pub fn rollback_for(workflow: &Workflow) -> DeployResult<Self> {
        if workflow.orchestration.phases.is_empty() {
            return Err(DeployError::RollbackPrecondition(format!(
                "Workflow {} has no phases to roll back",
                workflow.name
            )));
        }

        let mut machine = Self::empty(&workflow.uuid, true);
        for phase in workflow.orchestration.phases.iter().rev() {
            let node = match workflow.orchestration.rollback_phases.get(&phase.uuid) {
                Some(rollback_phase) => StateNode::from_phase(rollback_phase, true),
                None => {
                    let mut node = StateNode::from_phase(phase, true);
                    node.name = format!("Rollback {}", phase.name);
                    node
                }
            };
            machine.push_chained(node);
        }
        Ok(machine)
    }

    /// Build the state machine of a pipeline: one node per enabled stage element,
    /// with every node of a parallel group leading to every node of the next
    pub fn from_pipeline(pipeline: &Pipeline) -> DeployResult<Self> {
        if pipeline.element_count() == 0 {
            return Err(DeployError::Validation(format!(
                "Pipeline {} has no stages",
                pipeline.name
            )));
        }

        let mut machine = Self::empty(&pipeline.uuid, false);
        let mut previous_group: Vec<String> = Vec::new();
        let mut current_group: Vec<String> = Vec::new();
        let mut current_index = None;

        for (group_index, element) in pipeline.elements_with_groups() {
            if element.disabled {
                continue;
            }
            if current_index != Some(group_index) {
                if !current_group.is_empty() {
                    previous_group = std::mem::take(&mut current_group);
                }
                current_index = Some(group_index);
            }

            let state_type = element.element_type.state_type().unwrap_or(StateType::Step);
            let weight = match element.element_type {
                StageElementType::EnvState | StageElementType::EnvLoopState => 1,
                _ => 0,
            };
            let node = StateNode {
                name: element.name.clone(),
                state_type,
                element_id: Some(element.uuid.clone()),
                weight,
                rollback: element.element_type == StageElementType::EnvRollbackState,
                parallel_group: Some(group_index),
            };

            for from in &previous_group {
                machine.transitions.push(Transition {
                    from: from.clone(),
                    to: node.name.clone(),
                    kind: TransitionKind::Success,
                });
            }
            if machine.initial_state.is_none() {
                machine.initial_state = Some(node.name.clone());
            }
            current_group.push(node.name.clone());
            machine.nodes.push(node);
        }

        if machine.nodes.is_empty() {
            return Err(DeployError::Validation(format!(
                "Pipeline {} has no enabled stages",
                pipeline.name
            )));
        }
        Ok(machine)
    }

    /// Nodes counted by breakdowns, in declaration order
    pub fn counted_nodes(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes
            .iter()
            .filter(move |n| n.weight > 0 && n.rollback == self.rollback)
    }

    pub fn node(&self, name: &str) -> Option<&StateNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn successors(&self, name: &str, kind: TransitionKind) -> Vec<&StateNode> {
        self.transitions
            .iter()
            .filter(|t| t.from == name && t.kind == kind)
            .filter_map(|t| self.node(&t.to))
            .collect()
    }

    pub fn has_resource_constraint(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.state_type == StateType::ResourceConstraint)
    }

    pub fn expected_total(&self) -> u32 {
        self.counted_nodes().map(|n| n.weight).sum()
    }
}
