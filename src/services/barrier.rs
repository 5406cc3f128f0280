//! Rendezvous points for parallel pipeline stages.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::errors::{DeployError, DeployResult};

/// One workflow stage of a parallel group and the barrier steps it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierParticipant {
    pub pipeline_stage_element_id: String,
    pub workflow_id: String,
    pub barrier_identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub uuid: Uuid,
    pub pipeline_execution_id: Uuid,
    pub group_index: u32,
    pub identifier: String,
    /// Stage element ids that must arrive before the barrier opens
    pub participants: BTreeSet<String>,
    pub arrived: BTreeSet<String>,
}

impl Barrier {
    pub fn is_released(&self) -> bool {
        self.participants.is_subset(&self.arrived)
    }
}

#[async_trait]
pub trait BarrierService: std::fmt::Debug + Send + Sync + 'static {
    /// Barriers needed by one parallel group: one per identifier declared by at
    /// least two participants
    fn obtain_instances(
        &self,
        pipeline_execution_id: Uuid,
        group_index: u32,
        participants: &[BarrierParticipant],
    ) -> Vec<Barrier> {
        let mut by_identifier: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for participant in participants {
            for identifier in &participant.barrier_identifiers {
                by_identifier
                    .entry(identifier.as_str())
                    .or_default()
                    .insert(participant.pipeline_stage_element_id.clone());
            }
        }
        by_identifier
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(identifier, participants)| Barrier {
                uuid: Uuid::new_v4(),
                pipeline_execution_id,
                group_index,
                identifier: identifier.to_string(),
                participants,
                arrived: BTreeSet::new(),
            })
            .collect()
    }

    async fn save(&self, barrier: &Barrier) -> DeployResult<()>;

    async fn find(&self, pipeline_execution_id: Uuid) -> DeployResult<Vec<Barrier>>;

    /// Record an arrival; returns whether the barrier is now released
    async fn arrive(&self, barrier_id: Uuid, pipeline_stage_element_id: &str) -> DeployResult<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryBarrierService {
    barriers: DashMap<Uuid, Barrier>,
}

impl InMemoryBarrierService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BarrierService for InMemoryBarrierService {
    async fn save(&self, barrier: &Barrier) -> DeployResult<()> {
        self.barriers.insert(barrier.uuid, barrier.clone());
        Ok(())
    }

    async fn find(&self, pipeline_execution_id: Uuid) -> DeployResult<Vec<Barrier>> {
        let mut found: Vec<Barrier> = self
            .barriers
            .iter()
            .filter(|b| b.pipeline_execution_id == pipeline_execution_id)
            .map(|b| b.value().clone())
            .collect();
        found.sort_by(|a, b| {
            a.group_index
                .cmp(&b.group_index)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(found)
    }

    async fn arrive(&self, barrier_id: Uuid, pipeline_stage_element_id: &str) -> DeployResult<bool> {
        let mut barrier = self
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| DeployError::NotFound(format!("Barrier {barrier_id} not found")))?;
        if !barrier.participants.contains(pipeline_stage_element_id) {
            return Err(DeployError::Validation(format!(
                "Stage {pipeline_stage_element_id} does not participate in barrier {}",
                barrier.identifier
            )));
        }
        barrier.arrived.insert(pipeline_stage_element_id.to_string());
        Ok(barrier.is_released())
    }
}
