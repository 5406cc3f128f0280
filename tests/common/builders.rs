//! Fixture builders and an in-process harness wiring every collaborator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tasker_deploy::config::{ConfigManager, DeployConfig};
use tasker_deploy::constants::{
    DeploymentType, ExecutionStatus, OrchestrationWorkflowType, StageElementType, StateType,
    WorkflowType,
};
use tasker_deploy::models::{
    ApprovalData, Artifact, CallerContext, EnvStateData, ExecutionArgs, OrchestrationWorkflow,
    Pipeline, PipelineStage, PipelineStageElement, StateExecutionData, StateExecutionInstance,
    Workflow, WorkflowExecution, WorkflowPhase, WorkflowTree,
};
use tasker_deploy::orchestration::WorkflowExecutionService;
use tasker_deploy::services::{
    FreezeWindow, FreezeWindowChecker, InMemoryDefinitionRepository, InProcessRuntime,
    InProcessWaitNotify, PolicySet, StaticFeatureFlags,
};
use tasker_deploy::store::{ExecutionStore, InMemoryExecutionStore};
use tasker_deploy::system_context::SystemContext;
use uuid::Uuid;

pub const APP_ID: &str = "app-1";
pub const ACCOUNT_ID: &str = "acc-1";

pub fn caller() -> CallerContext {
    CallerContext::user(ACCOUNT_ID, "user-1", "Dana Deployer")
}

pub fn phase(name: &str) -> WorkflowPhase {
    WorkflowPhase {
        uuid: format!("{name}-id"),
        name: name.to_string(),
        service_id: Some("svc-1".to_string()),
        infra_definition_id: Some("infra-1".to_string()),
        instance_count: 1,
        steps: Vec::new(),
    }
}

/// Single-phase Kubernetes workflow on `infra-1` / `im-1`
pub fn workflow(id: &str) -> Workflow {
    Workflow {
        uuid: id.to_string(),
        app_id: APP_ID.to_string(),
        account_id: ACCOUNT_ID.to_string(),
        name: format!("{id} deploy"),
        orchestration: OrchestrationWorkflow {
            orchestration_type: OrchestrationWorkflowType::Basic,
            deployment_type: Some(DeploymentType::Kubernetes),
            pre_deployment_steps: Vec::new(),
            phases: vec![phase("Phase 1")],
            rollback_phases: HashMap::new(),
            post_deployment_steps: Vec::new(),
        },
        service_ids: vec!["svc-1".to_string()],
        env_id: Some("env-prod".to_string()),
        infra_definition_ids: vec!["infra-1".to_string()],
        infra_mapping_ids: vec!["im-1".to_string()],
        variables: Vec::new(),
        concurrency_strategy: None,
        k8s_v2: false,
        valid: true,
    }
}

pub fn env_element(name: &str, workflow_id: &str) -> PipelineStageElement {
    PipelineStageElement::new(format!("{name}-id"), name, StageElementType::EnvState)
        .with_workflow(workflow_id)
}

pub fn approval_element(name: &str) -> PipelineStageElement {
    PipelineStageElement::new(format!("{name}-id"), name, StageElementType::Approval)
}

/// Pipeline with one sequential stage per element
pub fn pipeline(id: &str, elements: Vec<PipelineStageElement>) -> Pipeline {
    Pipeline {
        uuid: id.to_string(),
        app_id: APP_ID.to_string(),
        account_id: ACCOUNT_ID.to_string(),
        name: format!("{id} pipeline"),
        stages: elements
            .into_iter()
            .enumerate()
            .map(|(i, element)| PipelineStage {
                name: format!("stage-{i}"),
                parallel: false,
                elements: vec![element],
            })
            .collect(),
        variables: Vec::new(),
        state_estimates: HashMap::new(),
    }
}

pub fn workflow_execution(workflow: &Workflow, status: ExecutionStatus) -> WorkflowExecution {
    let mut execution = WorkflowExecution::new(
        APP_ID,
        ACCOUNT_ID,
        &workflow.uuid,
        &workflow.name,
        WorkflowType::Orchestration,
        ExecutionArgs::default(),
    );
    execution.status = status;
    execution.service_ids = workflow.service_ids.clone();
    execution.env_ids = workflow.env_id.iter().cloned().collect();
    execution.infra_mapping_ids = workflow.infra_mapping_ids.clone();
    execution.infra_definition_ids = workflow.infra_definition_ids.clone();
    execution.deployment_type = workflow.orchestration.deployment_type;
    if status.is_final() {
        execution.ended_at = Some(Utc::now());
    }
    execution
}

pub fn with_artifacts(mut execution: WorkflowExecution, ids: &[&str]) -> WorkflowExecution {
    execution.args.artifacts = ids
        .iter()
        .map(|id| Artifact::new(*id, "docker", "1"))
        .collect();
    execution
}

pub fn approval_instance(
    execution_uuid: Uuid,
    approval_id: &str,
    services: &[&str],
    infras: &[&str],
) -> StateExecutionInstance {
    StateExecutionInstance::new(
        execution_uuid,
        APP_ID,
        ACCOUNT_ID,
        "Approve Prod",
        StateType::Approval,
        ExecutionStatus::Paused,
    )
    .with_data(StateExecutionData::Approval(ApprovalData {
        approval_id: approval_id.to_string(),
        service_ids: services.iter().map(|s| s.to_string()).collect(),
        infra_definition_ids: infras.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }))
}

pub fn env_instance(
    pipeline_execution_uuid: Uuid,
    stage_name: &str,
    workflow_id: &str,
    child: Option<Uuid>,
    status: ExecutionStatus,
) -> StateExecutionInstance {
    StateExecutionInstance::new(
        pipeline_execution_uuid,
        APP_ID,
        ACCOUNT_ID,
        stage_name,
        StateType::EnvState,
        status,
    )
    .with_data(StateExecutionData::Env(EnvStateData {
        workflow_id: workflow_id.to_string(),
        workflow_execution_id: child,
        ..Default::default()
    }))
}

/// Everything in-process, with handles on the collaborators tests drive
pub struct TestHarness {
    pub context: Arc<SystemContext>,
    pub service: WorkflowExecutionService,
    pub store: Arc<InMemoryExecutionStore>,
    pub definitions: Arc<InMemoryDefinitionRepository>,
    pub runtime: Arc<InProcessRuntime>,
    pub wait_notify: Arc<InProcessWaitNotify>,
    pub feature_flags: Arc<StaticFeatureFlags>,
    pub freeze: Arc<FreezeWindowChecker>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(DeployConfig::default())
    }

    pub fn with_config(config: DeployConfig) -> Self {
        Self::build(config, |policies| policies)
    }

    /// Harness whose limit policies are replaced by `policies`; the freeze
    /// checker is always the harness's own
    pub fn build(config: DeployConfig, policies: impl FnOnce(PolicySet) -> PolicySet) -> Self {
        let config_manager = ConfigManager::from_config(config).expect("valid test config");
        let store = Arc::new(InMemoryExecutionStore::new());
        let definitions = Arc::new(InMemoryDefinitionRepository::new());
        let runtime = Arc::new(InProcessRuntime::with_store(store.clone()));
        let wait_notify = Arc::new(InProcessWaitNotify::new());
        let feature_flags = Arc::new(StaticFeatureFlags::new());
        let freeze = Arc::new(FreezeWindowChecker::new());

        let context = Arc::new(
            SystemContext::builder(config_manager)
                .with_store(store.clone())
                .with_definitions(definitions.clone())
                .with_runtime(runtime.clone())
                .with_wait_notify(wait_notify.clone())
                .with_feature_flags(feature_flags.clone())
                .with_policies(PolicySet {
                    freeze: freeze.clone(),
                    ..policies(PolicySet::default())
                })
                .build(),
        );
        let service = WorkflowExecutionService::new(context.clone());

        Self {
            context,
            service,
            store,
            definitions,
            runtime,
            wait_notify,
            feature_flags,
            freeze,
        }
    }

    pub async fn save(&self, execution: &WorkflowExecution) -> WorkflowExecution {
        self.store
            .save_execution(execution)
            .await
            .expect("save execution")
    }

    pub async fn save_instance(&self, instance: &StateExecutionInstance) -> StateExecutionInstance {
        self.store
            .save_state_instance(instance)
            .await
            .expect("save state instance")
    }

    pub async fn load(&self, execution_uuid: Uuid) -> WorkflowExecution {
        self.store
            .get_execution(APP_ID, execution_uuid)
            .await
            .expect("load execution")
            .expect("execution exists")
    }

    pub fn freeze_now(&self, id: &str) {
        self.freeze.add_window(FreezeWindow {
            uuid: id.to_string(),
            name: format!("{id} window"),
            start: Utc::now() - chrono::Duration::hours(1),
            end: Utc::now() + chrono::Duration::hours(1),
            app_ids: Vec::new(),
            env_ids: Vec::new(),
        });
    }

    /// Poll until the cached tree appears; upserts run on a spawned task
    pub async fn cached_tree(&self, execution_uuid: Uuid) -> Option<WorkflowTree> {
        for _ in 0..50 {
            if let Some(tree) = self.store.get_tree(execution_uuid).await.expect("get tree") {
                return Some(tree);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Poll until `check` holds for the stored execution
    pub async fn eventually<F>(&self, execution_uuid: Uuid, check: F) -> WorkflowExecution
    where
        F: Fn(&WorkflowExecution) -> bool,
    {
        for _ in 0..100 {
            let execution = self.load(execution_uuid).await;
            if check(&execution) {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.load(execution_uuid).await
    }
}
