//! # Deploy Orchestrator
//!
//! Standalone process hosting the execution orchestrator against PostgreSQL.
//! Configuration comes from `config/deploy[.<env>].toml` under `DEPLOY_CONFIG_DIR`
//! and `DEPLOY__*` environment overrides.

use anyhow::Context;
use std::sync::Arc;
use tasker_deploy::config::ConfigManager;
use tasker_deploy::logging::init_structured_logging;
use tasker_deploy::orchestration::WorkflowExecutionService;
use tasker_deploy::store::PgExecutionStore;
use tasker_deploy::system_context::SystemContext;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let config_manager = ConfigManager::load().context("loading orchestrator configuration")?;
    info!(
        environment = %config_manager.environment(),
        config_file = ?config_manager.config_file(),
        "Configuration loaded"
    );

    let store = PgExecutionStore::connect(&config_manager.config().database)
        .await
        .context("connecting execution store")?;
    store.migrate().await.context("migrating execution store")?;

    let context = Arc::new(
        SystemContext::builder(config_manager)
            .with_store(Arc::new(store))
            .build(),
    );
    let service = WorkflowExecutionService::new(context.clone());
    info!(system_id = %context.system_id, "Deploy orchestrator ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    if let Err(e) = service.shutdown().await {
        error!(error = %e, "Interrupt fan-out did not shut down cleanly");
    }
    info!("Deploy orchestrator stopped");
    Ok(())
}
