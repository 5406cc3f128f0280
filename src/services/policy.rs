//! Pluggable policy collaborators evaluated on the trigger path.
//!
//! Every check returns a [`PolicyDecision`] rather than signalling rejection
//! through an error; errors are reserved for the checker itself failing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::errors::DeployResult;

/// What a deployment would touch, as seen by policy checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub account_id: String,
    pub app_id: String,
    pub env_ids: Vec<String>,
    pub service_ids: Vec<String>,
    pub workflow_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    AccountStatus,
    RateLimit,
    InstanceUsage,
    DeploymentFreeze,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AccountStatus => "account_status",
            Self::RateLimit => "rate_limit",
            Self::InstanceUsage => "instance_usage",
            Self::DeploymentFreeze => "deployment_freeze",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRejection {
    pub policy: PolicyKind,
    pub reason: String,
    /// Identifiers of the breaching policy objects (e.g. freeze window ids)
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "rejection", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allowed,
    Rejected(PolicyRejection),
}

impl PolicyDecision {
    pub fn reject(policy: PolicyKind, reason: impl Into<String>, identifiers: Vec<String>) -> Self {
        Self::Rejected(PolicyRejection {
            policy,
            reason: reason.into(),
            identifiers,
        })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[async_trait]
pub trait PolicyCheck: std::fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> PolicyKind;
    async fn check(&self, context: &DeploymentContext) -> DeployResult<PolicyDecision>;
}

/// Permits everything
#[derive(Debug, Clone, Copy)]
pub struct AllowAll(pub PolicyKind);

#[async_trait]
impl PolicyCheck for AllowAll {
    fn kind(&self) -> PolicyKind {
        self.0
    }

    async fn check(&self, _context: &DeploymentContext) -> DeployResult<PolicyDecision> {
        Ok(PolicyDecision::Allowed)
    }
}

/// A window during which deployments in scope are blocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeWindow {
    pub uuid: String,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Empty means every application
    #[serde(default)]
    pub app_ids: Vec<String>,
    /// Empty means every environment
    #[serde(default)]
    pub env_ids: Vec<String>,
}

impl FreezeWindow {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn applies_to(&self, context: &DeploymentContext) -> bool {
        let app_matches = self.app_ids.is_empty() || self.app_ids.contains(&context.app_id);
        let env_matches = self.env_ids.is_empty()
            || context.env_ids.is_empty()
            || context.env_ids.iter().any(|e| self.env_ids.contains(e));
        app_matches && env_matches
    }
}

#[derive(Debug, Default)]
pub struct FreezeWindowChecker {
    windows: DashMap<String, FreezeWindow>,
}

impl FreezeWindowChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_window(&self, window: FreezeWindow) {
        self.windows.insert(window.uuid.clone(), window);
    }

    pub fn remove_window(&self, uuid: &str) {
        self.windows.remove(uuid);
    }
}

#[async_trait]
impl PolicyCheck for FreezeWindowChecker {
    fn kind(&self) -> PolicyKind {
        PolicyKind::DeploymentFreeze
    }

    async fn check(&self, context: &DeploymentContext) -> DeployResult<PolicyDecision> {
        let now = Utc::now();
        let mut breaching: Vec<(String, String)> = self
            .windows
            .iter()
            .filter(|w| w.is_active_at(now) && w.applies_to(context))
            .map(|w| (w.uuid.clone(), w.name.clone()))
            .collect();
        if breaching.is_empty() {
            return Ok(PolicyDecision::Allowed);
        }
        breaching.sort();
        let names: Vec<&str> = breaching.iter().map(|(_, name)| name.as_str()).collect();
        Ok(PolicyDecision::reject(
            PolicyKind::DeploymentFreeze,
            format!("Deployment freeze window(s) active: {}", names.join(", ")),
            breaching.into_iter().map(|(id, _)| id).collect(),
        ))
    }
}

/// Sliding-window deployment rate limit per account. An allowed check counts
/// as a deployment.
#[derive(Debug)]
pub struct DeploymentRateLimiter {
    limit: usize,
    window: Duration,
    history: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl DeploymentRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            history: DashMap::new(),
        }
    }
}

#[async_trait]
impl PolicyCheck for DeploymentRateLimiter {
    fn kind(&self) -> PolicyKind {
        PolicyKind::RateLimit
    }

    async fn check(&self, context: &DeploymentContext) -> DeployResult<PolicyDecision> {
        let now = Utc::now();
        let mut history = self.history.entry(context.account_id.clone()).or_default();
        while history.front().is_some_and(|at| *at <= now - self.window) {
            history.pop_front();
        }
        if history.len() >= self.limit {
            return Ok(PolicyDecision::reject(
                PolicyKind::RateLimit,
                format!(
                    "Deployment rate limit of {} per {} minutes reached",
                    self.limit,
                    self.window.num_minutes()
                ),
                vec![context.account_id.clone()],
            ));
        }
        history.push_back(now);
        Ok(PolicyDecision::Allowed)
    }
}

/// Rejects accounts whose service-instance usage is at or above the limit
#[derive(Debug)]
pub struct InstanceUsageLimiter {
    limit: u64,
    usage: DashMap<String, u64>,
}

impl InstanceUsageLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            usage: DashMap::new(),
        }
    }

    pub fn set_usage(&self, account_id: impl Into<String>, instances: u64) {
        self.usage.insert(account_id.into(), instances);
    }
}

#[async_trait]
impl PolicyCheck for InstanceUsageLimiter {
    fn kind(&self) -> PolicyKind {
        PolicyKind::InstanceUsage
    }

    async fn check(&self, context: &DeploymentContext) -> DeployResult<PolicyDecision> {
        let used = self
            .usage
            .get(&context.account_id)
            .map(|u| *u.value())
            .unwrap_or(0);
        if used >= self.limit {
            return Ok(PolicyDecision::reject(
                PolicyKind::InstanceUsage,
                format!("Service instance usage {used} exceeds the limit of {}", self.limit),
                vec![context.account_id.clone()],
            ));
        }
        Ok(PolicyDecision::Allowed)
    }
}

/// Rejects expired accounts
#[derive(Debug, Default)]
pub struct AccountStatusChecker {
    expired: DashSet<String>,
}

impl AccountStatusChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire(&self, account_id: impl Into<String>) {
        self.expired.insert(account_id.into());
    }
}

#[async_trait]
impl PolicyCheck for AccountStatusChecker {
    fn kind(&self) -> PolicyKind {
        PolicyKind::AccountStatus
    }

    async fn check(&self, context: &DeploymentContext) -> DeployResult<PolicyDecision> {
        if self.expired.contains(&context.account_id) {
            return Ok(PolicyDecision::reject(
                PolicyKind::AccountStatus,
                "Account license has expired",
                vec![context.account_id.clone()],
            ));
        }
        Ok(PolicyDecision::Allowed)
    }
}

/// The policy objects consulted on every trigger
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub account_status: Arc<dyn PolicyCheck>,
    pub rate_limit: Arc<dyn PolicyCheck>,
    pub instance_usage: Arc<dyn PolicyCheck>,
    pub freeze: Arc<dyn PolicyCheck>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            account_status: Arc::new(AllowAll(PolicyKind::AccountStatus)),
            rate_limit: Arc::new(AllowAll(PolicyKind::RateLimit)),
            instance_usage: Arc::new(AllowAll(PolicyKind::InstanceUsage)),
            freeze: Arc::new(AllowAll(PolicyKind::DeploymentFreeze)),
        }
    }
}

impl PolicySet {
    /// Checks other than the freeze, in evaluation order
    pub fn limit_checks(&self) -> [&Arc<dyn PolicyCheck>; 3] {
        [&self.account_status, &self.rate_limit, &self.instance_usage]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeploymentContext {
        DeploymentContext {
            account_id: "acc".into(),
            app_id: "app".into(),
            env_ids: vec!["prod".into()],
            service_ids: vec!["svc".into()],
            workflow_id: "wf".into(),
        }
    }

    #[tokio::test]
    async fn active_freeze_window_rejects_with_its_id() {
        let checker = FreezeWindowChecker::new();
        checker.add_window(FreezeWindow {
            uuid: "fw-1".into(),
            name: "holidays".into(),
            start: Utc::now() - Duration::hours(1),
            end: Utc::now() + Duration::hours(1),
            app_ids: vec![],
            env_ids: vec!["prod".into()],
        });
        match checker.check(&context()).await.unwrap() {
            PolicyDecision::Rejected(rejection) => {
                assert_eq!(rejection.identifiers, vec!["fw-1".to_string()]);
                assert_eq!(rejection.policy, PolicyKind::DeploymentFreeze);
            }
            PolicyDecision::Allowed => panic!("freeze window should reject"),
        }
    }

    #[tokio::test]
    async fn expired_or_out_of_scope_windows_allow() {
        let checker = FreezeWindowChecker::new();
        checker.add_window(FreezeWindow {
            uuid: "fw-old".into(),
            name: "old".into(),
            start: Utc::now() - Duration::hours(2),
            end: Utc::now() - Duration::hours(1),
            app_ids: vec![],
            env_ids: vec![],
        });
        checker.add_window(FreezeWindow {
            uuid: "fw-qa".into(),
            name: "qa".into(),
            start: Utc::now() - Duration::hours(1),
            end: Utc::now() + Duration::hours(1),
            app_ids: vec![],
            env_ids: vec!["qa".into()],
        });
        assert!(checker.check(&context()).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn rate_limiter_counts_allowed_deployments() {
        let limiter = DeploymentRateLimiter::new(2, Duration::minutes(1));
        assert!(limiter.check(&context()).await.unwrap().is_allowed());
        assert!(limiter.check(&context()).await.unwrap().is_allowed());
        assert!(!limiter.check(&context()).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn instance_usage_and_account_status() {
        let usage = InstanceUsageLimiter::new(10);
        usage.set_usage("acc", 10);
        assert!(!usage.check(&context()).await.unwrap().is_allowed());

        let status = AccountStatusChecker::new();
        assert!(status.check(&context()).await.unwrap().is_allowed());
        status.expire("acc");
        assert!(!status.check(&context()).await.unwrap().is_allowed());
    }
}
