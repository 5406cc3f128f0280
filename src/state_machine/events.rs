use serde::{Deserialize, Serialize};

use super::states::ExecutionStatus;

/// Events that can trigger workflow execution status transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// Parameterized artifacts must be resolved before queuing
    Prepare,
    /// Artifact/manifest resolution finished
    PreparationSucceeded,
    /// Artifact/manifest resolution failed with the given reason
    PreparationFailed(String),
    /// Hand the execution to the runtime
    Queue,
    /// Runtime started the first state
    Start,
    /// Suspended behind a resource-constraint permit
    AwaitPermit,
    /// A permit was released to this execution
    PermitGranted,
    /// Aborted before or during execution
    Abort,
    /// Refused by admission policy with a reason
    Reject(String),
    /// Status reported by the runtime's update callback
    Report(ExecutionStatus),
}

impl ExecutionEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::PreparationSucceeded => "preparation_succeeded",
            Self::PreparationFailed(_) => "preparation_failed",
            Self::Queue => "queue",
            Self::Start => "start",
            Self::AwaitPermit => "await_permit",
            Self::PermitGranted => "permit_granted",
            Self::Abort => "abort",
            Self::Reject(_) => "reject",
            Self::Report(_) => "report",
        }
    }

    /// Extract the failure or rejection reason if present
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::PreparationFailed(msg) | Self::Reject(msg) => Some(msg),
            _ => None,
        }
    }
}
