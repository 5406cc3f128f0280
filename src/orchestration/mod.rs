//! # Orchestration
//!
//! The execution orchestrator's components, each owning one slice of the
//! lifecycle of a workflow or pipeline execution:
//!
//! - **AdmissionService**: authorization, limit and freeze policies, artifact
//!   preparation, resource-constraint queuing, hand-off to the runtime
//! - **PipelineStageOrchestrator**: pipeline stage rows projected from state
//!   instances, plus per-stage duration estimates
//! - **ApprovalGateController**: approval decisions, expiry and auto-reject of
//!   superseded approvals
//! - **InterruptPropagator**: interrupt validation and cascade to nested
//!   executions through a fan-out worker
//! - **RollbackEngine**: on-demand rollback to a previous artifact set
//! - **BreakdownCalculator** / **GraphCache**: progress breakdowns and the
//!   watermarked execution graph cache
//! - **WorkflowExecutionService**: facade tying the above together and handling
//!   runtime status callbacks
//!
//! State instances are the ground truth. Pipeline rows, breakdowns and graphs
//! are recomputed from them on demand, so concurrent refreshers never need
//! locks: a lost write is recomputed by the next read.

pub mod admission;
pub mod approval;
pub mod graph_cache;
pub mod interrupts;
pub mod pipeline_stage;
pub mod rollback;
pub mod service;
pub mod status;

pub use admission::{resolve_variables, Admission, AdmissionService, TriggerOptions};
pub use approval::{ApprovalAction, ApprovalDetails, ApprovalGateController, ApprovalOutcome};
pub use graph_cache::{render_graph, GraphCache};
pub use interrupts::{
    validate_interrupt, CascadeFanout, CascadeOutcome, InterruptPropagator, InterruptReceipt,
};
pub use pipeline_stage::{aggregate_status, PipelineStageOrchestrator};
pub use rollback::{select_previous_execution, RollbackEngine, RollbackOrigin};
pub use service::WorkflowExecutionService;
pub use status::{count_rolling_instances, BreakdownCalculator};
