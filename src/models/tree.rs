//! Cached rendered execution graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{ExecutionStatus, StateType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub name: String,
    pub state_type: StateType,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub children: Vec<GraphNode>,
}

impl GraphNode {
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(GraphNode::node_count).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub roots: Vec<GraphNode>,
}

impl ExecutionGraph {
    pub fn node_count(&self) -> usize {
        self.roots.iter().map(GraphNode::node_count).sum()
    }
}

/// Rendered graph stamped with the state-instance watermark it was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTree {
    pub execution_uuid: Uuid,
    /// Highest state-instance revision that contributed to the graph
    pub context_order: u64,
    #[serde(default)]
    pub was_invalidated: bool,
    pub override_status: Option<ExecutionStatus>,
    pub graph: ExecutionGraph,
    pub computed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkflowTree {
    /// Usable only when built from at least the current watermark, never
    /// invalidated and still inside the freshness window
    pub fn is_usable(&self, watermark: u64, now: DateTime<Utc>, freshness: chrono::Duration) -> bool {
        !self.was_invalidated
            && self.context_order >= watermark
            && now - self.computed_at <= freshness
            && now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(context_order: u64, age_ms: i64) -> WorkflowTree {
        let now = Utc::now();
        WorkflowTree {
            execution_uuid: Uuid::new_v4(),
            context_order,
            was_invalidated: false,
            override_status: None,
            graph: ExecutionGraph::default(),
            computed_at: now - chrono::Duration::milliseconds(age_ms),
            expires_at: now + chrono::Duration::days(30),
        }
    }

    #[test]
    fn stale_watermark_is_not_usable() {
        let freshness = chrono::Duration::seconds(5);
        assert!(tree(10, 0).is_usable(10, Utc::now(), freshness));
        assert!(!tree(9, 0).is_usable(10, Utc::now(), freshness));
    }

    #[test]
    fn old_or_invalidated_trees_are_not_usable() {
        let freshness = chrono::Duration::seconds(5);
        assert!(!tree(10, 6_000).is_usable(10, Utc::now(), freshness));
        let mut invalidated = tree(10, 0);
        invalidated.was_invalidated = true;
        assert!(!invalidated.is_usable(0, Utc::now(), freshness));
    }
}
