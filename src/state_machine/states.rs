use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a workflow execution, a state execution instance or a pipeline stage row.
///
/// The same vocabulary is shared by all three so that a pipeline stage can inherit
/// the status of the nested execution it wraps without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, not yet admitted to the runtime
    #[default]
    New,
    /// Parameterized artifacts/manifests are being resolved
    Preparing,
    /// Persisted and handed to the runtime
    Queued,
    Starting,
    Running,
    /// Suspended on an approval, runtime inputs or a resource-constraint permit
    Waiting,
    Pausing,
    Paused,
    Discontinuing,
    Success,
    Failed,
    Error,
    Aborted,
    Rejected,
    Expired,
    Skipped,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 16] = [
        Self::New,
        Self::Preparing,
        Self::Queued,
        Self::Starting,
        Self::Running,
        Self::Waiting,
        Self::Pausing,
        Self::Paused,
        Self::Discontinuing,
        Self::Success,
        Self::Failed,
        Self::Error,
        Self::Aborted,
        Self::Rejected,
        Self::Expired,
        Self::Skipped,
    ];

    /// Check if this is a final status (no further transitions or interrupts allowed)
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Failed
                | Self::Error
                | Self::Aborted
                | Self::Rejected
                | Self::Expired
                | Self::Skipped
        )
    }

    /// Check if this status represents an unsuccessful end
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Error | Self::Aborted | Self::Rejected | Self::Expired
        )
    }

    /// Check if work is actively progressing
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Discontinuing | Self::Pausing
        )
    }

    /// Check if the status is a suspension that resumes through wait/notify or a resume interrupt
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Waiting | Self::Paused)
    }

    /// All non-final statuses, used for "currently active" store queries
    pub fn non_final() -> Vec<ExecutionStatus> {
        Self::ALL.iter().copied().filter(|s| !s.is_final()).collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Preparing => "PREPARING",
            Self::Queued => "QUEUED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Discontinuing => "DISCONTINUING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Aborted => "ABORTED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid execution status: {s}"))
    }
}
