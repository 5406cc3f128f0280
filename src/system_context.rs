use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::{ConfigManager, DeployConfig};
use crate::errors::DeployResult;
use crate::events::EventPublisher;
use crate::services::{
    ArtifactResolver, AuthorizationService, BarrierService, DefinitionRepository,
    FeatureFlagEvaluator, InMemoryBarrierService, InMemoryDefinitionRepository,
    InMemoryOutputStore, InMemoryResourceConstraintService, InProcessRuntime,
    InProcessWaitNotify, OutputVariableStore, ParameterArtifactResolver, PolicySet,
    ResourceConstraintService, StateMachineRuntime, StaticAuthorizationService,
    StaticFeatureFlags, WaitNotify,
};
use crate::state_machine::ExecutionStateMachine;
use crate::store::{ExecutionStore, InMemoryExecutionStore, PgExecutionStore};

/// Shared orchestrator dependencies and configuration
///
/// This serves as a dependency injection container providing access to:
/// - Configuration manager
/// - Execution store (Postgres or in-memory)
/// - Collaborators: runtime, wait/notify, resource constraints, barriers,
///   output variables, definitions, authorization, feature flags, policies
/// - Event publisher
pub struct SystemContext {
    /// System instance ID
    pub system_id: Uuid,

    pub config_manager: Arc<ConfigManager>,
    pub store: Arc<dyn ExecutionStore>,
    pub runtime: Arc<dyn StateMachineRuntime>,
    pub wait_notify: Arc<dyn WaitNotify>,
    pub resource_constraints: Arc<dyn ResourceConstraintService>,
    pub barriers: Arc<dyn BarrierService>,
    pub outputs: Arc<dyn OutputVariableStore>,
    pub definitions: Arc<dyn DefinitionRepository>,
    pub artifact_resolver: Arc<dyn ArtifactResolver>,
    pub authorization: Arc<dyn AuthorizationService>,
    pub feature_flags: Arc<dyn FeatureFlagEvaluator>,
    pub policies: PolicySet,
    pub event_publisher: Arc<EventPublisher>,
}

impl std::fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemContext")
            .field("system_id", &self.system_id)
            .field("environment", &self.config_manager.environment())
            .field("store", &self.store)
            .field("runtime", &"Arc<dyn StateMachineRuntime>")
            .field("policies", &self.policies)
            .field(
                "event_subscribers",
                &self.event_publisher.subscriber_count(),
            )
            .finish()
    }
}

impl SystemContext {
    /// Create a SystemContext backed by Postgres, loading configuration from
    /// the detected environment
    pub async fn new() -> DeployResult<Self> {
        info!("Initializing SystemContext with auto-detected environment configuration");
        let config_manager = ConfigManager::load()?;
        Self::from_config(config_manager).await
    }

    /// Connect the Postgres store described by the configuration and wire the
    /// in-process collaborators around it
    pub async fn from_config(config_manager: Arc<ConfigManager>) -> DeployResult<Self> {
        let store = PgExecutionStore::connect(&config_manager.config().database).await?;
        info!(
            environment = %config_manager.environment(),
            "Execution store connected"
        );
        Ok(SystemContextBuilder::new(config_manager)
            .with_store(Arc::new(store))
            .build())
    }

    /// Fully in-process context with default configuration
    pub fn in_memory() -> Self {
        SystemContextBuilder::new(Arc::new(ConfigManager::default())).build()
    }

    pub fn config(&self) -> &DeployConfig {
        self.config_manager.config()
    }

    pub fn builder(config_manager: Arc<ConfigManager>) -> SystemContextBuilder {
        SystemContextBuilder::new(config_manager)
    }

    /// Status lifecycle manager bound to this context's store and publisher
    pub fn execution_state_machine(&self) -> ExecutionStateMachine {
        ExecutionStateMachine::new(self.store.clone(), self.event_publisher.clone())
    }
}

/// Builder defaulting every collaborator to its in-process implementation
pub struct SystemContextBuilder {
    config_manager: Arc<ConfigManager>,
    store: Option<Arc<dyn ExecutionStore>>,
    runtime: Option<Arc<dyn StateMachineRuntime>>,
    wait_notify: Option<Arc<dyn WaitNotify>>,
    resource_constraints: Option<Arc<dyn ResourceConstraintService>>,
    barriers: Option<Arc<dyn BarrierService>>,
    outputs: Option<Arc<dyn OutputVariableStore>>,
    definitions: Option<Arc<dyn DefinitionRepository>>,
    artifact_resolver: Option<Arc<dyn ArtifactResolver>>,
    authorization: Option<Arc<dyn AuthorizationService>>,
    feature_flags: Option<Arc<dyn FeatureFlagEvaluator>>,
    policies: PolicySet,
    event_publisher: Option<Arc<EventPublisher>>,
}

impl SystemContextBuilder {
    pub fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            config_manager,
            store: None,
            runtime: None,
            wait_notify: None,
            resource_constraints: None,
            barriers: None,
            outputs: None,
            definitions: None,
            artifact_resolver: None,
            authorization: None,
            feature_flags: None,
            policies: PolicySet::default(),
            event_publisher: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn StateMachineRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_wait_notify(mut self, wait_notify: Arc<dyn WaitNotify>) -> Self {
        self.wait_notify = Some(wait_notify);
        self
    }

    pub fn with_resource_constraints(
        mut self,
        resource_constraints: Arc<dyn ResourceConstraintService>,
    ) -> Self {
        self.resource_constraints = Some(resource_constraints);
        self
    }

    pub fn with_barriers(mut self, barriers: Arc<dyn BarrierService>) -> Self {
        self.barriers = Some(barriers);
        self
    }

    pub fn with_outputs(mut self, outputs: Arc<dyn OutputVariableStore>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_definitions(mut self, definitions: Arc<dyn DefinitionRepository>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn with_artifact_resolver(mut self, resolver: Arc<dyn ArtifactResolver>) -> Self {
        self.artifact_resolver = Some(resolver);
        self
    }

    pub fn with_authorization(mut self, authorization: Arc<dyn AuthorizationService>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn with_feature_flags(mut self, feature_flags: Arc<dyn FeatureFlagEvaluator>) -> Self {
        self.feature_flags = Some(feature_flags);
        self
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_event_publisher(mut self, event_publisher: Arc<EventPublisher>) -> Self {
        self.event_publisher = Some(event_publisher);
        self
    }

    pub fn build(self) -> SystemContext {
        let config = self.config_manager.config();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()));
        let wait_notify = self
            .wait_notify
            .unwrap_or_else(|| Arc::new(InProcessWaitNotify::new()));
        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(InProcessRuntime::with_store(store.clone())));
        let resource_constraints = self.resource_constraints.unwrap_or_else(|| {
            Arc::new(InMemoryResourceConstraintService::new(wait_notify.clone()))
        });
        let event_publisher = self
            .event_publisher
            .unwrap_or_else(|| Arc::new(EventPublisher::new(config.events.channel_capacity)));

        SystemContext {
            system_id: Uuid::new_v4(),
            store,
            runtime,
            wait_notify,
            resource_constraints,
            barriers: self
                .barriers
                .unwrap_or_else(|| Arc::new(InMemoryBarrierService::new())),
            outputs: self
                .outputs
                .unwrap_or_else(|| Arc::new(InMemoryOutputStore::new())),
            definitions: self
                .definitions
                .unwrap_or_else(|| Arc::new(InMemoryDefinitionRepository::new())),
            artifact_resolver: self
                .artifact_resolver
                .unwrap_or_else(|| Arc::new(ParameterArtifactResolver)),
            authorization: self
                .authorization
                .unwrap_or_else(|| Arc::new(StaticAuthorizationService::new())),
            feature_flags: self
                .feature_flags
                .unwrap_or_else(|| Arc::new(StaticFeatureFlags::new())),
            policies: self.policies,
            event_publisher,
            config_manager: self.config_manager,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_context_uses_default_config() {
        let context = SystemContext::in_memory();
        assert_eq!(context.config().pipeline.estimate_sample_size, 5);
        assert!(format!("{context:?}").contains("SystemContext"));
    }
}
