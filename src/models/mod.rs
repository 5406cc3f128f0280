//! # Data Model
//!
//! Executions, state instances, interrupts and cached trees persisted by the
//! execution store, plus the read-only definitions they are created from.

pub mod context;
pub mod definition;
pub mod execution;
pub mod interrupt;
pub mod state_instance;
pub mod tree;

pub use context::{CallerContext, CallerPermissions};
pub use definition::{
    ConcurrencyStrategy, HoldingScope, OrchestrationWorkflow, ParallelGroup, Pipeline,
    PipelineStage, PipelineStageElement, StepDefinition, Variable, Workflow, WorkflowPhase,
};
pub use execution::{
    ApprovalStageInfo, Artifact, ArtifactVariable, Breakdown, ExecutionArgs, NestedExecution,
    ParallelInfo, PipelineExecution, PipelineStageExecution, WorkflowExecution,
};
pub use interrupt::ExecutionInterrupt;
pub use state_instance::{
    ApprovalData, ApprovalDecision, ContextElement, DeploymentData, ElementStatusSummary,
    EnvStateData, ForkData, InstanceStatusSummary, InterruptEffect, PhaseData, RepeatData,
    ResourceConstraintData, SkipData, StateExecutionData, StateExecutionInstance,
};
pub use tree::{ExecutionGraph, GraphNode, WorkflowTree};
