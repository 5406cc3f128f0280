//! Correlation-id keyed resumption of suspended states.
//!
//! Approval gates, stages awaiting runtime inputs and permit queues suspend by
//! recording state; whoever resolves them calls `done_with` with the matching
//! correlation id. Resumption may happen on any worker.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::DeployResult;
use crate::models::ApprovalData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NotifyPayload {
    /// Decision record for an approval gate
    Approval(ApprovalData),
    /// A queued consumer was granted its resource-constraint permit
    PermitGranted {
        resource_name: String,
        release_entity_id: String,
    },
    /// Runtime inputs supplied to a stage waiting on them
    Continue(BTreeMap<String, String>),
}

impl NotifyPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approval(_) => "approval",
            Self::PermitGranted { .. } => "permit_granted",
            Self::Continue(_) => "continue",
        }
    }
}

#[async_trait]
pub trait WaitNotify: std::fmt::Debug + Send + Sync + 'static {
    async fn done_with(&self, correlation_id: &str, payload: NotifyPayload) -> DeployResult<()>;
}

/// Waiters keyed by correlation id. Payloads delivered before anyone waits are
/// kept until claimed.
#[derive(Debug, Default)]
pub struct InProcessWaitNotify {
    waiters: DashMap<String, oneshot::Sender<NotifyPayload>>,
    undelivered: DashMap<String, NotifyPayload>,
}

impl InProcessWaitNotify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a correlation id
    pub fn wait_for(&self, correlation_id: &str) -> oneshot::Receiver<NotifyPayload> {
        let (tx, rx) = oneshot::channel();
        match self.undelivered.remove(correlation_id) {
            Some((_, payload)) => {
                // Receiver is alive in this scope
                let _ = tx.send(payload);
            }
            None => {
                self.waiters.insert(correlation_id.to_string(), tx);
            }
        }
        rx
    }

    /// Take a payload that arrived with no waiter
    pub fn take_undelivered(&self, correlation_id: &str) -> Option<NotifyPayload> {
        self.undelivered.remove(correlation_id).map(|(_, p)| p)
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }
}

#[async_trait]
impl WaitNotify for InProcessWaitNotify {
    async fn done_with(&self, correlation_id: &str, payload: NotifyPayload) -> DeployResult<()> {
        debug!(correlation_id = %correlation_id, kind = payload.kind(), "Notifying waiter");
        match self.waiters.remove(correlation_id) {
            Some((_, tx)) => {
                if let Err(payload) = tx.send(payload) {
                    self.undelivered.insert(correlation_id.to_string(), payload);
                }
            }
            None => {
                self.undelivered.insert(correlation_id.to_string(), payload);
            }
        }
        Ok(())
    }
}
