//! Named, capacity-bounded permits limiting concurrent deployments.
//!
//! Acquisition never blocks: a consumer is either granted a permit or told its
//! queue position. Releasing promotes queued consumers in FIFO order and
//! notifies each through wait/notify keyed by its correlation id.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::wait_notify::{NotifyPayload, WaitNotify};
use crate::errors::{DeployError, DeployResult};
use crate::models::HoldingScope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitRequest {
    pub resource_name: String,
    pub unit: String,
    pub capacity: u32,
    pub permits: u32,
    pub holding_scope: HoldingScope,
    /// Entity whose completion releases the permit (execution or pipeline run)
    pub release_entity_id: String,
    /// Wait/notify correlation id used when a queued request is promoted
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PermitState {
    Active,
    /// 1-based position in the queue
    Queued { position: usize },
}

#[async_trait]
pub trait ResourceConstraintService: std::fmt::Debug + Send + Sync + 'static {
    async fn acquire(&self, request: &PermitRequest) -> DeployResult<PermitState>;

    /// Release every permit held or awaited by the entity, returning the
    /// requests promoted to active as a result
    async fn release(&self, release_entity_id: &str) -> DeployResult<Vec<PermitRequest>>;

    /// Entities queued on resources the given entity currently holds
    async fn queued_behind(&self, release_entity_id: &str) -> DeployResult<Vec<String>>;
}

#[derive(Debug, Default)]
struct Slot {
    capacity: u32,
    active: Vec<PermitRequest>,
    queue: VecDeque<PermitRequest>,
}

impl Slot {
    fn used(&self) -> u32 {
        self.active.iter().map(|r| r.permits).sum()
    }

    fn fits(&self, request: &PermitRequest) -> bool {
        self.used() + request.permits <= self.capacity
    }

    fn state_of(&self, release_entity_id: &str) -> Option<PermitState> {
        if self
            .active
            .iter()
            .any(|r| r.release_entity_id == release_entity_id)
        {
            return Some(PermitState::Active);
        }
        self.queue
            .iter()
            .position(|r| r.release_entity_id == release_entity_id)
            .map(|index| PermitState::Queued { position: index + 1 })
    }

    fn promote(&mut self) -> Vec<PermitRequest> {
        let mut promoted = Vec::new();
        while let Some(next) = self.queue.front() {
            if !self.fits(next) {
                break;
            }
            if let Some(next) = self.queue.pop_front() {
                self.active.push(next.clone());
                promoted.push(next);
            }
        }
        promoted
    }
}

#[derive(Debug)]
pub struct InMemoryResourceConstraintService {
    slots: Mutex<HashMap<(String, String), Slot>>,
    wait_notify: Arc<dyn WaitNotify>,
}

impl InMemoryResourceConstraintService {
    pub fn new(wait_notify: Arc<dyn WaitNotify>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_notify,
        }
    }

    pub fn active_count(&self, resource_name: &str, unit: &str) -> usize {
        self.slots
            .lock()
            .get(&(resource_name.to_string(), unit.to_string()))
            .map(|slot| slot.active.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceConstraintService for InMemoryResourceConstraintService {
    async fn acquire(&self, request: &PermitRequest) -> DeployResult<PermitState> {
        if request.capacity == 0 || request.permits == 0 || request.permits > request.capacity {
            return Err(DeployError::Validation(format!(
                "Resource constraint {} cannot grant {} of {} permits",
                request.resource_name, request.permits, request.capacity
            )));
        }

        let mut slots = self.slots.lock();
        let slot = slots
            .entry((request.resource_name.clone(), request.unit.clone()))
            .or_default();
        slot.capacity = request.capacity;

        if let Some(state) = slot.state_of(&request.release_entity_id) {
            return Ok(state);
        }

        let state = if slot.queue.is_empty() && slot.fits(request) {
            slot.active.push(request.clone());
            PermitState::Active
        } else {
            slot.queue.push_back(request.clone());
            PermitState::Queued {
                position: slot.queue.len(),
            }
        };
        debug!(
            resource = %request.resource_name,
            unit = %request.unit,
            consumer = %request.release_entity_id,
            state = ?state,
            "Resource constraint acquisition"
        );
        Ok(state)
    }

    async fn release(&self, release_entity_id: &str) -> DeployResult<Vec<PermitRequest>> {
        let promoted: Vec<PermitRequest> = {
            let mut slots = self.slots.lock();
            let mut promoted = Vec::new();
            for slot in slots.values_mut() {
                let before = slot.active.len() + slot.queue.len();
                slot.active.retain(|r| r.release_entity_id != release_entity_id);
                slot.queue.retain(|r| r.release_entity_id != release_entity_id);
                if slot.active.len() + slot.queue.len() != before {
                    promoted.extend(slot.promote());
                }
            }
            promoted
        };

        for request in &promoted {
            info!(
                resource = %request.resource_name,
                consumer = %request.release_entity_id,
                "Resource constraint permit granted to queued consumer"
            );
            let payload = NotifyPayload::PermitGranted {
                resource_name: request.resource_name.clone(),
                release_entity_id: request.release_entity_id.clone(),
            };
            if let Err(e) = self
                .wait_notify
                .done_with(&request.correlation_id, payload)
                .await
            {
                error!(consumer = %request.release_entity_id, error = %e, "Failed to notify promoted consumer");
            }
        }
        Ok(promoted)
    }

    async fn queued_behind(&self, release_entity_id: &str) -> DeployResult<Vec<String>> {
        let slots = self.slots.lock();
        Ok(slots
            .values()
            .filter(|slot| {
                slot.active
                    .iter()
                    .any(|r| r.release_entity_id == release_entity_id)
            })
            .flat_map(|slot| slot.queue.iter().map(|r| r.release_entity_id.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::InProcessWaitNotify;

    fn request(entity: &str) -> PermitRequest {
        PermitRequest {
            resource_name: "queue".into(),
            unit: "infra-1".into(),
            capacity: 1,
            permits: 1,
            holding_scope: HoldingScope::Workflow,
            release_entity_id: entity.into(),
            correlation_id: format!("rc-{entity}"),
        }
    }

    #[tokio::test]
    async fn second_consumer_queues_until_release() {
        let wait_notify = Arc::new(InProcessWaitNotify::new());
        let service = InMemoryResourceConstraintService::new(wait_notify.clone());

        assert_eq!(service.acquire(&request("a")).await.unwrap(), PermitState::Active);
        assert_eq!(
            service.acquire(&request("b")).await.unwrap(),
            PermitState::Queued { position: 1 }
        );
        assert_eq!(service.queued_behind("a").await.unwrap(), vec!["b".to_string()]);

        let rx = wait_notify.wait_for("rc-b");
        let promoted = service.release("a").await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(rx.await.unwrap().kind(), "permit_granted");
        assert_eq!(service.active_count("queue", "infra-1"), 1);
    }

    #[tokio::test]
    async fn acquisition_is_idempotent_per_consumer() {
        let service = InMemoryResourceConstraintService::new(Arc::new(InProcessWaitNotify::new()));
        service.acquire(&request("a")).await.unwrap();
        assert_eq!(service.acquire(&request("a")).await.unwrap(), PermitState::Active);
        assert_eq!(service.active_count("queue", "infra-1"), 1);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let service = InMemoryResourceConstraintService::new(Arc::new(InProcessWaitNotify::new()));
        let mut oversized = request("a");
        oversized.permits = 2;
        assert!(service.acquire(&oversized).await.is_err());
    }
}
