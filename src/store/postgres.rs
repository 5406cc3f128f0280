//! PostgreSQL-backed [`ExecutionStore`].
//!
//! Records are stored as JSONB documents next to the handful of columns the
//! orchestrator filters on. Revisions come from `deploy_revision_seq`, so
//! executions, state instances and trees share one monotonic clock.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ExecutionQuery, ExecutionStore, ExecutionUpdate, ReadPreference, StateInstanceQuery};
use crate::config::DatabaseConfig;
use crate::errors::{StoreError, StoreResult};
use crate::models::{
    ExecutionInterrupt, PipelineExecution, StateExecutionInstance, WorkflowExecution,
    WorkflowTree,
};

const SCHEMA: &str = include_str!("../../migrations/20260101000000_create_deploy_tables.sql");

#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
    /// Pool used for secondary-preference listings; falls back to `pool`
    replica: Option<PgPool>,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            replica: None,
        }
    }

    pub fn with_replica(mut self, replica: PgPool) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Connect the primary (and optional replica) pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = Self::pool_options(config).connect(&config.url).await?;
        info!(
            max_connections = config.max_connections,
            "Execution store connected to primary database"
        );

        let mut store = Self::new(pool);
        if let Some(replica_url) = &config.read_replica_url {
            let replica = Self::pool_options(config).connect(replica_url).await?;
            info!("Execution store connected to read replica");
            store = store.with_replica(replica);
        }
        Ok(store)
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
    }

    /// Create tables, indexes and the revision sequence if missing
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("Execution store schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn read_pool(&self, preference: ReadPreference) -> &PgPool {
        match (preference, &self.replica) {
            (ReadPreference::Secondary, Some(replica)) => replica,
            _ => &self.pool,
        }
    }

    async fn next_revision<'e, E>(executor: E) -> StoreResult<i64>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query("SELECT nextval('deploy_revision_seq') AS revision")
            .fetch_one(executor)
            .await?;
        Ok(row.try_get("revision")?)
    }

    async fn write_execution<'e, E>(
        executor: E,
        execution: &WorkflowExecution,
    ) -> StoreResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO deploy_workflow_executions
                (uuid, app_id, account_id, workflow_id, status, infra_mapping_ids,
                 pipeline_execution_id, created_at, revision, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (uuid) DO UPDATE SET
                status = EXCLUDED.status,
                infra_mapping_ids = EXCLUDED.infra_mapping_ids,
                pipeline_execution_id = EXCLUDED.pipeline_execution_id,
                revision = EXCLUDED.revision,
                document = EXCLUDED.document
            "#,
        )
        .bind(execution.uuid)
        .bind(&execution.app_id)
        .bind(&execution.account_id)
        .bind(&execution.workflow_id)
        .bind(execution.status.as_str())
        .bind(&execution.infra_mapping_ids)
        .bind(execution.pipeline_execution_id)
        .bind(execution.created_at)
        .bind(execution.revision as i64)
        .bind(serde_json::to_value(execution)?)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn lock_execution(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        uuid: Uuid,
    ) -> StoreResult<Option<WorkflowExecution>> {
        let row = sqlx::query(
            "SELECT document, revision FROM deploy_workflow_executions WHERE uuid = $1 FOR UPDATE",
        )
        .bind(uuid)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(decode_execution).transpose()
    }
}

fn decode_document<T: DeserializeOwned>(row: &PgRow) -> StoreResult<T> {
    let document: serde_json::Value = row.try_get("document")?;
    Ok(serde_json::from_value(document)?)
}

fn decode_execution(row: &PgRow) -> StoreResult<WorkflowExecution> {
    let mut execution: WorkflowExecution = decode_document(row)?;
    let revision: i64 = row.try_get("revision")?;
    execution.revision = revision as u64;
    Ok(execution)
}

fn decode_state_instance(row: &PgRow) -> StoreResult<StateExecutionInstance> {
    let mut instance: StateExecutionInstance = decode_document(row)?;
    let revision: i64 = row.try_get("revision")?;
    instance.revision = revision as u64;
    Ok(instance)
}

/// Text form of a serde enum, matching what the documents contain
fn enum_text<T: Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> StoreResult<WorkflowExecution> {
        let mut tx = self.pool.begin().await?;
        let mut stored = execution.clone();
        stored.revision = Self::next_revision(&mut *tx).await? as u64;
        Self::write_execution(&mut *tx, &stored).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn get_execution(
        &self,
        app_id: &str,
        uuid: Uuid,
    ) -> StoreResult<Option<WorkflowExecution>> {
        let row = sqlx::query(
            "SELECT document, revision FROM deploy_workflow_executions WHERE uuid = $1 AND app_id = $2",
        )
        .bind(uuid)
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_execution).transpose()
    }

    async fn update_execution(
        &self,
        uuid: Uuid,
        update: &ExecutionUpdate,
    ) -> StoreResult<Option<u64>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut execution) = Self::lock_execution(&mut tx, uuid).await? else {
            return Ok(None);
        };
        update.apply(&mut execution);
        execution.revision = Self::next_revision(&mut *tx).await? as u64;
        Self::write_execution(&mut *tx, &execution).await?;
        tx.commit().await?;
        Ok(Some(execution.revision))
    }

    async fn update_pipeline_execution(
        &self,
        uuid: Uuid,
        expected_revision: u64,
        pipeline_execution: &PipelineExecution,
    ) -> StoreResult<Option<u64>> {
        let mut tx = self.pool.begin().await?;
        let Some(mut execution) = Self::lock_execution(&mut tx, uuid).await? else {
            return Ok(None);
        };
        if execution.revision != expected_revision {
            return Err(StoreError::ConcurrentModification {
                entity: "workflow_execution",
                id: uuid.to_string(),
            });
        }
        execution.pipeline_execution = Some(pipeline_execution.clone());
        execution.revision = Self::next_revision(&mut *tx).await? as u64;
        Self::write_execution(&mut *tx, &execution).await?;
        tx.commit().await?;
        Ok(Some(execution.revision))
    }

    async fn query_executions(
        &self,
        query: &ExecutionQuery,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT document, revision FROM deploy_workflow_executions WHERE TRUE",
        );
        if let Some(app_id) = &query.app_id {
            builder.push(" AND app_id = ").push_bind(app_id.clone());
        }
        if let Some(account_id) = &query.account_id {
            builder.push(" AND account_id = ").push_bind(account_id.clone());
        }
        if let Some(workflow_id) = &query.workflow_id {
            builder.push(" AND workflow_id = ").push_bind(workflow_id.clone());
        }
        if let Some(infra_mapping_id) = &query.infra_mapping_id {
            builder
                .push(" AND ")
                .push_bind(infra_mapping_id.clone())
                .push(" = ANY(infra_mapping_ids)");
        }
        if let Some(pipeline_execution_id) = query.pipeline_execution_id {
            builder
                .push(" AND pipeline_execution_id = ")
                .push_bind(pipeline_execution_id);
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(after) = query.created_after {
            builder.push(" AND created_at > ").push_bind(after);
        }
        if let Some(before) = query.created_before {
            builder.push(" AND created_at < ").push_bind(before);
        }
        builder.push(" ORDER BY created_at DESC, revision DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(self.read_pool(query.read_preference))
            .await?;
        rows.iter().map(decode_execution).collect()
    }

    async fn save_state_instance(
        &self,
        instance: &StateExecutionInstance,
    ) -> StoreResult<StateExecutionInstance> {
        let mut tx = self.pool.begin().await?;
        let mut stored = instance.clone();
        stored.revision = Self::next_revision(&mut *tx).await? as u64;
        sqlx::query(
            r#"
            INSERT INTO deploy_state_execution_instances
                (uuid, execution_uuid, account_id, state_type, status, created_at, revision, document)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (uuid) DO UPDATE SET
                status = EXCLUDED.status,
                revision = EXCLUDED.revision,
                document = EXCLUDED.document
            "#,
        )
        .bind(stored.uuid)
        .bind(stored.execution_uuid)
        .bind(&stored.account_id)
        .bind(enum_text(&stored.state_type)?)
        .bind(stored.status.as_str())
        .bind(stored.created_at)
        .bind(stored.revision as i64)
        .bind(serde_json::to_value(&stored)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn get_state_instance(&self, uuid: Uuid) -> StoreResult<Option<StateExecutionInstance>> {
        let row = sqlx::query(
            "SELECT document, revision FROM deploy_state_execution_instances WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_state_instance).transpose()
    }

    async fn find_state_instances(
        &self,
        query: &StateInstanceQuery,
    ) -> StoreResult<Vec<StateExecutionInstance>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT document, revision FROM deploy_state_execution_instances WHERE TRUE",
        );
        if let Some(account_id) = &query.account_id {
            builder.push(" AND account_id = ").push_bind(account_id.clone());
        }
        if let Some(execution_uuid) = query.execution_uuid {
            builder.push(" AND execution_uuid = ").push_bind(execution_uuid);
        }
        if let Some(state_type) = &query.state_type {
            builder.push(" AND state_type = ").push_bind(enum_text(state_type)?);
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        builder.push(" ORDER BY created_at, revision");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_state_instance).collect()
    }

    async fn max_state_revision(&self, execution_uuid: Uuid) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(revision), 0) AS watermark FROM deploy_state_execution_instances WHERE execution_uuid = $1",
        )
        .bind(execution_uuid)
        .fetch_one(&self.pool)
        .await?;
        let watermark: i64 = row.try_get("watermark")?;
        Ok(watermark as u64)
    }

    async fn save_interrupt(&self, interrupt: &ExecutionInterrupt) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deploy_execution_interrupts (uuid, execution_uuid, created_at, document)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uuid) DO NOTHING
            "#,
        )
        .bind(interrupt.uuid)
        .bind(interrupt.execution_uuid)
        .bind(interrupt.created_at)
        .bind(serde_json::to_value(interrupt)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_interrupts(&self, execution_uuid: Uuid) -> StoreResult<Vec<ExecutionInterrupt>> {
        let rows = sqlx::query(
            "SELECT document FROM deploy_execution_interrupts WHERE execution_uuid = $1 ORDER BY created_at",
        )
        .bind(execution_uuid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_document).collect()
    }

    async fn get_tree(&self, execution_uuid: Uuid) -> StoreResult<Option<WorkflowTree>> {
        let row = sqlx::query(
            "SELECT document FROM deploy_workflow_trees WHERE execution_uuid = $1 AND expires_at > NOW()",
        )
        .bind(execution_uuid)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_document).transpose()
    }

    async fn upsert_tree(&self, tree: &WorkflowTree) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deploy_workflow_trees (execution_uuid, context_order, expires_at, document)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (execution_uuid) DO UPDATE SET
                context_order = EXCLUDED.context_order,
                expires_at = EXCLUDED.expires_at,
                document = EXCLUDED.document
            "#,
        )
        .bind(tree.execution_uuid)
        .bind(tree.context_order as i64)
        .bind(tree.expires_at)
        .bind(serde_json::to_value(tree)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ExecutionStatus, StateType};

    #[test]
    fn enum_columns_use_serde_names() {
        assert_eq!(enum_text(&StateType::EnvLoopState).unwrap(), "ENV_LOOP_STATE");
        assert_eq!(enum_text(&ExecutionStatus::Paused).unwrap(), "PAUSED");
    }

    #[test]
    fn schema_declares_every_table() {
        for table in [
            "deploy_workflow_executions",
            "deploy_state_execution_instances",
            "deploy_execution_interrupts",
            "deploy_workflow_trees",
            "deploy_revision_seq",
        ] {
            assert!(SCHEMA.contains(table), "missing {table}");
        }
    }
}
