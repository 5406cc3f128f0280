use std::collections::HashMap;

use super::definition::StateMachine;
use super::states::ExecutionStatus;
use crate::models::Breakdown;

/// Projects a progress breakdown by replaying a static state machine against
/// the statuses currently known for its states.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakdownSimulator;

impl BreakdownSimulator {
    /// Returns the projected breakdown and its total. The total is the simulated
    /// sum, so the breakdown always adds up.
    pub fn simulate(
        machine: &StateMachine,
        known: &HashMap<String, ExecutionStatus>,
        execution_status: ExecutionStatus,
    ) -> (Breakdown, u32) {
        let mut breakdown = Breakdown::default();
        let mut halted = false;

        for node in machine.counted_nodes() {
            let projected = match known.get(&node.name) {
                Some(status) => {
                    if status.is_broken() {
                        halted = true;
                    }
                    *status
                }
                // Nothing after a failure will run
                None if halted => ExecutionStatus::Failed,
                None if execution_status.is_final() => {
                    if execution_status == ExecutionStatus::Success {
                        ExecutionStatus::Success
                    } else {
                        ExecutionStatus::Failed
                    }
                }
                None => ExecutionStatus::Queued,
            };
            for _ in 0..node.weight {
                breakdown.record(projected);
            }
        }

        let total = breakdown.total();
        (breakdown, total)
    }
}
