use serde::{Deserialize, Serialize};

use crate::constants::TriggerOrigin;

/// Explicit permissions carried by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerPermissions {
    /// May deploy through an active deployment freeze
    pub override_freeze: bool,
    /// May abort/pause/resume executions
    pub execute_interrupts: bool,
}

/// Identity and permissions of whoever invoked an entry point.
///
/// Passed explicitly to every operation; nothing in the orchestrator reads a
/// "current user" from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub account_id: String,
    pub user_id: String,
    pub user_name: String,
    /// User groups for interactive callers, the key's groups for API keys
    #[serde(default)]
    pub user_group_ids: Vec<String>,
    #[serde(default)]
    pub origin: TriggerOrigin,
    #[serde(default)]
    pub permissions: CallerPermissions,
}

impl CallerContext {
    pub fn user(
        account_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_group_ids: Vec::new(),
            origin: TriggerOrigin::Manual,
            permissions: CallerPermissions {
                override_freeze: false,
                execute_interrupts: true,
            },
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_group_ids = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_origin(mut self, origin: TriggerOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_freeze_override(mut self) -> Self {
        self.permissions.override_freeze = true;
        self
    }

    /// True when the caller shares at least one group with `groups`
    pub fn shares_group_with(&self, groups: &[String]) -> bool {
        groups.iter().any(|g| self.user_group_ids.contains(g))
    }
}
