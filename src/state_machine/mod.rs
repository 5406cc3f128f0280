// State machine module for deployment executions
//
// Two concerns live here: the lifecycle of a WorkflowExecution's own status
// (events, guards and transitions), and the static StateMachine definitions
// handed to the runtime, which the breakdown simulator also replays.

pub mod states;
pub mod events;
pub mod guards;
pub mod actions;
pub mod errors;
pub mod execution_state_machine;
pub mod definition;
pub mod simulator;

// Re-export main types for convenient access
pub use states::ExecutionStatus;
pub use events::ExecutionEvent;
pub use execution_state_machine::ExecutionStateMachine;
pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use definition::{StateMachine, StateNode, Transition, TransitionKind};
pub use simulator::BreakdownSimulator;

// Common traits
pub use guards::StateGuard;
pub use actions::StateAction;
