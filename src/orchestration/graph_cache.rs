//! Cached execution graph.
//!
//! A stored [`WorkflowTree`] is served only while its `context_order` is at
//! least the current watermark (the highest state-instance revision of the
//! execution), it was never invalidated, and it is inside the freshness window.
//! Anything else is recomputed and written back in the background.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::ExecutionStatus;
use crate::errors::DeployResult;
use crate::models::{ExecutionGraph, GraphNode, StateExecutionInstance, WorkflowTree};
use crate::store::StateInstanceQuery;
use crate::system_context::SystemContext;

#[derive(Debug, Clone)]
pub struct GraphCache {
    context: Arc<SystemContext>,
}

impl GraphCache {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self { context }
    }

    /// Return a usable tree for the execution, recomputing when stale
    pub async fn calculate_tree(&self, execution_uuid: Uuid) -> DeployResult<WorkflowTree> {
        let store = &self.context.store;
        let config = &self.context.config().graph_cache;
        let watermark = store.max_state_revision(execution_uuid).await?;
        let now = Utc::now();

        if let Some(cached) = store.get_tree(execution_uuid).await? {
            if cached.is_usable(watermark, now, config.freshness_window()) {
                debug!(execution_uuid = %execution_uuid, context_order = cached.context_order, "Serving cached tree");
                return Ok(cached);
            }
            debug!(
                execution_uuid = %execution_uuid,
                context_order = cached.context_order,
                watermark = watermark,
                invalidated = cached.was_invalidated,
                "Cached tree is stale"
            );
        }

        let instances = store
            .find_state_instances(&StateInstanceQuery::for_execution(execution_uuid))
            .await?;
        let tree = WorkflowTree {
            execution_uuid,
            context_order: watermark,
            was_invalidated: false,
            override_status: None,
            graph: render_graph(&instances),
            computed_at: now,
            expires_at: now + config.tree_ttl(),
        };

        let store = store.clone();
        let cached = tree.clone();
        tokio::spawn(async move {
            if let Err(e) = store.upsert_tree(&cached).await {
                warn!(execution_uuid = %cached.execution_uuid, error = %e, "Failed to cache execution tree");
            }
        });
        Ok(tree)
    }

    /// Force the next read to recompute by storing an invalidated copy with a
    /// downgraded watermark and a short expiry
    pub async fn invalidate(
        &self,
        execution_uuid: Uuid,
        override_status: Option<ExecutionStatus>,
    ) -> DeployResult<()> {
        let store = &self.context.store;
        let Some(mut tree) = store.get_tree(execution_uuid).await? else {
            return Ok(());
        };
        let now = Utc::now();
        tree.context_order = tree.context_order.saturating_sub(1);
        tree.was_invalidated = true;
        tree.override_status = override_status;
        tree.expires_at = now + self.context.config().graph_cache.invalidated_tree_ttl();
        store.upsert_tree(&tree).await?;
        debug!(execution_uuid = %execution_uuid, "Cached tree invalidated");
        Ok(())
    }
}

/// Build the parent/child graph of state instances in creation order
pub fn render_graph(instances: &[StateExecutionInstance]) -> ExecutionGraph {
    let known: std::collections::HashSet<Uuid> = instances.iter().map(|i| i.uuid).collect();
    let mut children: HashMap<Option<Uuid>, Vec<&StateExecutionInstance>> = HashMap::new();
    for instance in instances {
        let parent = instance
            .parent_instance_id
            .filter(|parent| known.contains(parent));
        children.entry(parent).or_default().push(instance);
    }

    fn build(
        instance: &StateExecutionInstance,
        children: &HashMap<Option<Uuid>, Vec<&StateExecutionInstance>>,
    ) -> GraphNode {
        GraphNode {
            id: instance.uuid,
            name: instance.display_name.clone(),
            state_type: instance.state_type,
            status: instance.status,
            rollback: instance.rollback,
            children: children
                .get(&Some(instance.uuid))
                .map(|kids| kids.iter().map(|kid| build(kid, children)).collect())
                .unwrap_or_default(),
        }
    }

    ExecutionGraph {
        roots: children
            .get(&None)
            .map(|roots| roots.iter().map(|root| build(root, &children)).collect())
            .unwrap_or_default(),
    }
}
