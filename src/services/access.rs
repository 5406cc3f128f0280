//! Authorization and feature-flag collaborators.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::errors::DeployResult;
use crate::models::CallerContext;

#[async_trait]
pub trait AuthorizationService: std::fmt::Debug + Send + Sync + 'static {
    /// Whether the caller may deploy to the given environments of the app
    async fn can_execute(
        &self,
        caller: &CallerContext,
        app_id: &str,
        env_ids: &[String],
    ) -> DeployResult<bool>;

    /// Display names for user group ids, skipping unknown ids
    async fn user_group_names(&self, account_id: &str, group_ids: &[String])
        -> DeployResult<Vec<String>>;
}

/// Allows everyone except explicitly denied users
#[derive(Debug, Default)]
pub struct StaticAuthorizationService {
    denied_users: DashSet<String>,
    group_names: DashMap<String, String>,
}

impl StaticAuthorizationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user(&self, user_id: impl Into<String>) {
        self.denied_users.insert(user_id.into());
    }

    pub fn name_group(&self, group_id: impl Into<String>, name: impl Into<String>) {
        self.group_names.insert(group_id.into(), name.into());
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorizationService {
    async fn can_execute(
        &self,
        caller: &CallerContext,
        _app_id: &str,
        _env_ids: &[String],
    ) -> DeployResult<bool> {
        Ok(!self.denied_users.contains(&caller.user_id))
    }

    async fn user_group_names(
        &self,
        _account_id: &str,
        group_ids: &[String],
    ) -> DeployResult<Vec<String>> {
        Ok(group_ids
            .iter()
            .filter_map(|id| self.group_names.get(id).map(|n| n.value().clone()))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureFlag {
    /// Approving an approval rejects other paused approvals with the same scope
    AutoRejectPreviousDeployments,
    /// Rollback resolves the last artifact set that differs from the current one
    ArtifactDiffAwareRollback,
}

pub trait FeatureFlagEvaluator: std::fmt::Debug + Send + Sync + 'static {
    fn is_enabled(&self, flag: FeatureFlag, account_id: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    global: DashSet<FeatureFlag>,
    per_account: DashSet<(FeatureFlag, String)>,
}

impl StaticFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, flag: FeatureFlag) {
        self.global.insert(flag);
    }

    pub fn enable_for(&self, flag: FeatureFlag, account_id: impl Into<String>) {
        self.per_account.insert((flag, account_id.into()));
    }
}

impl FeatureFlagEvaluator for StaticFeatureFlags {
    fn is_enabled(&self, flag: FeatureFlag, account_id: &str) -> bool {
        self.global.contains(&flag) || self.per_account.contains(&(flag, account_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_scoped_flags() {
        let flags = StaticFeatureFlags::new();
        flags.enable_for(FeatureFlag::AutoRejectPreviousDeployments, "acc-1");
        assert!(flags.is_enabled(FeatureFlag::AutoRejectPreviousDeployments, "acc-1"));
        assert!(!flags.is_enabled(FeatureFlag::AutoRejectPreviousDeployments, "acc-2"));
        flags.enable(FeatureFlag::ArtifactDiffAwareRollback);
        assert!(flags.is_enabled(FeatureFlag::ArtifactDiffAwareRollback, "acc-2"));
    }

    #[tokio::test]
    async fn denied_users_cannot_execute() {
        let auth = StaticAuthorizationService::new();
        auth.deny_user("u2");
        let allowed = CallerContext::user("acc", "u1", "one");
        let denied = CallerContext::user("acc", "u2", "two");
        assert!(auth.can_execute(&allowed, "app", &[]).await.unwrap());
        assert!(!auth.can_execute(&denied, "app", &[]).await.unwrap());
    }
}
