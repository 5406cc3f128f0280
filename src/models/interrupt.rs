use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::ExecutionInterruptType;

/// A pause/resume/abort/rollback command consumed once by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInterrupt {
    pub uuid: Uuid,
    pub app_id: String,
    pub execution_uuid: Uuid,
    pub interrupt_type: ExecutionInterruptType,
    pub state_execution_instance_id: Option<Uuid>,
    /// Set when this interrupt was cloned from a pipeline-level interrupt
    pub cascaded_from: Option<Uuid>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionInterrupt {
    pub fn new(
        app_id: impl Into<String>,
        execution_uuid: Uuid,
        interrupt_type: ExecutionInterruptType,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            app_id: app_id.into(),
            execution_uuid,
            interrupt_type,
            state_execution_instance_id: None,
            cascaded_from: None,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn targeting_state(mut self, state_execution_instance_id: Uuid) -> Self {
        self.state_execution_instance_id = Some(state_execution_instance_id);
        self
    }

    /// Copy with a fresh identity retargeted at a nested execution
    pub fn cascade_to(&self, child_execution_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            app_id: self.app_id.clone(),
            execution_uuid: child_execution_uuid,
            interrupt_type: self.interrupt_type,
            state_execution_instance_id: None,
            cascaded_from: Some(self.uuid),
            created_by: self.created_by.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascaded_copy_has_new_identity_and_target() {
        let parent = ExecutionInterrupt::new("app", Uuid::new_v4(), ExecutionInterruptType::AbortAll);
        let child_id = Uuid::new_v4();
        let child = parent.cascade_to(child_id);
        assert_ne!(child.uuid, parent.uuid);
        assert_eq!(child.execution_uuid, child_id);
        assert_eq!(child.interrupt_type, parent.interrupt_type);
        assert_eq!(child.cascaded_from, Some(parent.uuid));
    }
}
