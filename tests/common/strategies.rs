//! Proptest strategies for definitions and state statuses.

use proptest::prelude::*;
use tasker_deploy::constants::{ExecutionStatus, StageElementType};
use tasker_deploy::models::{PipelineStage, PipelineStageElement};

pub fn status_strategy() -> impl Strategy<Value = ExecutionStatus> {
    prop_oneof![
        Just(ExecutionStatus::Queued),
        Just(ExecutionStatus::Starting),
        Just(ExecutionStatus::Running),
        Just(ExecutionStatus::Waiting),
        Just(ExecutionStatus::Paused),
        Just(ExecutionStatus::Success),
        Just(ExecutionStatus::Failed),
        Just(ExecutionStatus::Error),
        Just(ExecutionStatus::Aborted),
        Just(ExecutionStatus::Rejected),
        Just(ExecutionStatus::Skipped),
    ]
}

pub fn execution_status_strategy() -> impl Strategy<Value = ExecutionStatus> {
    prop_oneof![
        Just(ExecutionStatus::Running),
        Just(ExecutionStatus::Paused),
        Just(ExecutionStatus::Success),
        Just(ExecutionStatus::Failed),
        Just(ExecutionStatus::Aborted),
    ]
}

/// Non-loop stage kinds
pub fn element_type_strategy() -> impl Strategy<Value = StageElementType> {
    prop_oneof![
        3 => Just(StageElementType::EnvState),
        1 => Just(StageElementType::Approval),
        1 => Just(StageElementType::Unknown),
    ]
}

/// Stages of 1-3 elements with unique names, each optionally parallel to the
/// previous stage
pub fn stages_strategy() -> impl Strategy<Value = Vec<PipelineStage>> {
    prop::collection::vec(
        (
            any::<bool>(),
            prop::collection::vec((element_type_strategy(), any::<bool>()), 1..=3),
        ),
        1..=5,
    )
    .prop_map(|stages| {
        let mut counter = 0usize;
        stages
            .into_iter()
            .enumerate()
            .map(|(i, (parallel, elements))| PipelineStage {
                name: format!("stage-{i}"),
                parallel: i > 0 && parallel,
                elements: elements
                    .into_iter()
                    .map(|(element_type, disabled)| {
                        counter += 1;
                        let mut element = PipelineStageElement::new(
                            format!("element-{counter}"),
                            format!("Element {counter}"),
                            element_type,
                        );
                        if element_type == StageElementType::EnvState {
                            element.workflow_id = Some("wf-stage".to_string());
                        }
                        element.disabled = disabled && counter % 3 == 0;
                        element
                    })
                    .collect(),
            })
            .collect()
    })
}
