//! # Interrupt Propagator
//!
//! Validates and registers pause/resume/abort/rollback interrupts. Pipeline
//! interrupts are cascaded to every nested workflow execution that is still
//! running, through a small command-driven fan-out worker:
//!
//! ```text
//! issue_interrupt(pipeline) ──► save + runtime.register_interrupt
//!                           └─► CascadeCommand::Cascade ──► worker
//!                                                           ├─► child A (retry, backoff)
//!                                                           ├─► child B (retry, backoff)
//!                                                           └─► outcomes via oneshot
//! ```
//!
//! A child whose registration keeps failing is logged and reported in the
//! outcome list; it never blocks its siblings.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::InterruptConfig;
use crate::constants::{events, ExecutionInterruptType, ExecutionStatus};
use crate::errors::{DeployError, DeployResult};
use crate::logging::log_interrupt_operation;
use crate::models::{CallerContext, ExecutionInterrupt, InterruptEffect, WorkflowExecution};
use crate::state_machine::ExecutionEvent;
use crate::system_context::SystemContext;

use super::graph_cache::GraphCache;

type CascadeResponder<T> = oneshot::Sender<DeployResult<T>>;

/// Commands accepted by the cascade worker
#[derive(Debug)]
pub enum CascadeCommand {
    /// Register a retargeted copy of `interrupt` against each child execution
    Cascade {
        interrupt: ExecutionInterrupt,
        children: Vec<Uuid>,
        resp: CascadeResponder<Vec<CascadeOutcome>>,
    },
    Shutdown { resp: CascadeResponder<()> },
}

/// Result of cascading one interrupt to one nested execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub child_execution_uuid: Uuid,
    /// Identity of the cloned interrupt when registration succeeded
    pub interrupt_id: Option<Uuid>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl CascadeOutcome {
    pub fn is_registered(&self) -> bool {
        self.interrupt_id.is_some()
    }
}

/// What an accepted interrupt did
#[derive(Debug, Clone)]
pub struct InterruptReceipt {
    pub interrupt: ExecutionInterrupt,
    pub cascaded: Vec<CascadeOutcome>,
    /// The execution had not reached the runtime and was aborted in place
    pub finalized: bool,
}

/// Handle to the cascade worker task
#[derive(Debug, Clone)]
pub struct CascadeFanout {
    sender: mpsc::Sender<CascadeCommand>,
}

impl CascadeFanout {
    /// Spawn the worker on the current Tokio runtime
    pub fn spawn(context: Arc<SystemContext>) -> Self {
        let config = context.config().interrupts.clone();
        let (sender, receiver) = mpsc::channel(config.cascade_channel_capacity);
        let worker = CascadeWorker {
            graph_cache: GraphCache::new(context.clone()),
            context,
            config,
            receiver,
        };
        tokio::spawn(worker.run());
        Self { sender }
    }

    pub async fn cascade(
        &self,
        interrupt: ExecutionInterrupt,
        children: Vec<Uuid>,
    ) -> DeployResult<Vec<CascadeOutcome>> {
        let (resp, rx) = oneshot::channel();
        self.sender
            .send(CascadeCommand::Cascade {
                interrupt,
                children,
                resp,
            })
            .await
            .map_err(|_| DeployError::Internal("Cascade worker is not running".to_string()))?;
        rx.await
            .map_err(|_| DeployError::Internal("Cascade worker dropped the request".to_string()))?
    }

    pub async fn shutdown(&self) -> DeployResult<()> {
        let (resp, rx) = oneshot::channel();
        if self.sender.send(CascadeCommand::Shutdown { resp }).await.is_err() {
            return Ok(());
        }
        rx.await
            .map_err(|_| DeployError::Internal("Cascade worker dropped the request".to_string()))?
    }
}

struct CascadeWorker {
    context: Arc<SystemContext>,
    graph_cache: GraphCache,
    config: InterruptConfig,
    receiver: mpsc::Receiver<CascadeCommand>,
}

impl CascadeWorker {
    async fn run(mut self) {
        debug!("Cascade worker started");
        while let Some(command) = self.receiver.recv().await {
            match command {
                CascadeCommand::Cascade {
                    interrupt,
                    children,
                    resp,
                } => {
                    let outcomes = futures::future::join_all(
                        children
                            .into_iter()
                            .map(|child| self.cascade_to_child(&interrupt, child)),
                    )
                    .await;
                    let _ = resp.send(Ok(outcomes));
                }
                CascadeCommand::Shutdown { resp } => {
                    let _ = resp.send(Ok(()));
                    break;
                }
            }
        }
        debug!("Cascade worker stopped");
    }

    async fn cascade_to_child(&self, parent: &ExecutionInterrupt, child: Uuid) -> CascadeOutcome {
        let cloned = parent.cascade_to(child);
        let attempts_allowed = self.config.cascade_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts_allowed {
            match self.register(&cloned).await {
                Ok(()) => {
                    log_interrupt_operation(
                        "cascade",
                        child,
                        &cloned.interrupt_type.to_string(),
                        "registered",
                    );
                    return CascadeOutcome {
                        child_execution_uuid: child,
                        interrupt_id: Some(cloned.uuid),
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(DeployError::AlreadyCompleted { .. }) => {
                    debug!(child_execution = %child, "Nested execution finished before cascade");
                    return CascadeOutcome {
                        child_execution_uuid: child,
                        interrupt_id: None,
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(
                        child_execution = %child,
                        attempt = attempt,
                        error = %e,
                        "Cascaded interrupt registration failed"
                    );
                    last_error = Some(e.to_string());
                    if attempt < attempts_allowed {
                        tokio::time::sleep(self.config.cascade_retry_backoff() * attempt).await;
                    }
                }
            }
        }

        error!(
            parent_interrupt = %parent.uuid,
            child_execution = %child,
            interrupt_type = %parent.interrupt_type,
            "Giving up cascading interrupt to nested execution"
        );
        CascadeOutcome {
            child_execution_uuid: child,
            interrupt_id: None,
            attempts: attempts_allowed,
            error: last_error,
        }
    }

    async fn register(&self, interrupt: &ExecutionInterrupt) -> DeployResult<()> {
        let child = self
            .context
            .store
            .get_execution(&interrupt.app_id, interrupt.execution_uuid)
            .await?
            .ok_or_else(|| {
                DeployError::NotFound(format!("Execution {} not found", interrupt.execution_uuid))
            })?;
        if child.status.is_final() {
            return Err(DeployError::AlreadyCompleted {
                execution_uuid: child.uuid,
            });
        }
        self.context.store.save_interrupt(interrupt).await?;
        self.context.runtime.register_interrupt(interrupt).await?;
        self.graph_cache
            .invalidate(interrupt.execution_uuid, status_hint(interrupt.interrupt_type))
            .await
    }
}

/// Accepts interrupts against workflow and pipeline executions
#[derive(Debug, Clone)]
pub struct InterruptPropagator {
    context: Arc<SystemContext>,
    graph_cache: GraphCache,
    fanout: CascadeFanout,
}

impl InterruptPropagator {
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self {
            graph_cache: GraphCache::new(context.clone()),
            fanout: CascadeFanout::spawn(context.clone()),
            context,
        }
    }

    /// Validate and register an interrupt, cascading pipeline interrupts to
    /// their running nested executions
    pub async fn issue_interrupt(
        &self,
        caller: &CallerContext,
        mut interrupt: ExecutionInterrupt,
    ) -> DeployResult<InterruptReceipt> {
        if !caller.permissions.execute_interrupts {
            return Err(DeployError::Unauthorized(format!(
                "User {} may not interrupt executions",
                caller.user_id
            )));
        }
        interrupt.created_by.get_or_insert_with(|| caller.user_name.clone());
        self.raise_interrupt(interrupt).await
    }

    /// Register an interrupt on behalf of the orchestrator itself, without a
    /// caller permission check
    #[instrument(skip_all, fields(
        execution_uuid = %interrupt.execution_uuid,
        interrupt_type = %interrupt.interrupt_type
    ))]
    pub(crate) async fn raise_interrupt(
        &self,
        interrupt: ExecutionInterrupt,
    ) -> DeployResult<InterruptReceipt> {
        let mut execution = self
            .context
            .store
            .get_execution(&interrupt.app_id, interrupt.execution_uuid)
            .await?
            .ok_or_else(|| {
                DeployError::NotFound(format!("Execution {} not found", interrupt.execution_uuid))
            })?;

        validate_interrupt(&execution, &interrupt)?;

        if matches!(execution.status, ExecutionStatus::Preparing | ExecutionStatus::Waiting)
            && interrupt.interrupt_type == ExecutionInterruptType::AbortAll
        {
            return self.abort_before_start(&mut execution, interrupt).await;
        }

        self.context.store.save_interrupt(&interrupt).await?;
        self.context.runtime.register_interrupt(&interrupt).await?;

        if let Some(state_id) = interrupt.state_execution_instance_id {
            self.record_effect(&interrupt, state_id).await?;
        }

        let cascaded = if execution.is_pipeline() {
            let children = self.running_children(&execution).await?;
            if children.is_empty() {
                Vec::new()
            } else {
                self.fanout.cascade(interrupt.clone(), children).await?
            }
        } else {
            Vec::new()
        };

        self.accepted(&interrupt, cascaded.len()).await?;
        Ok(InterruptReceipt {
            interrupt,
            cascaded,
            finalized: false,
        })
    }

    /// Nothing has reached the runtime yet (still preparing or parked behind a
    /// permit), so the execution is finalized directly
    async fn abort_before_start(
        &self,
        execution: &mut WorkflowExecution,
        interrupt: ExecutionInterrupt,
    ) -> DeployResult<InterruptReceipt> {
        let from = execution.status;
        self.context.store.save_interrupt(&interrupt).await?;
        self.context
            .execution_state_machine()
            .transition(execution, ExecutionEvent::Abort)
            .await?;
        info!(execution_uuid = %execution.uuid, from = %from, "Aborted execution before it started");
        self.accepted(&interrupt, 0).await?;
        Ok(InterruptReceipt {
            interrupt,
            cascaded: Vec::new(),
            finalized: true,
        })
    }

    async fn accepted(&self, interrupt: &ExecutionInterrupt, cascaded: usize) -> DeployResult<()> {
        self.graph_cache
            .invalidate(interrupt.execution_uuid, status_hint(interrupt.interrupt_type))
            .await?;
        let _ = self
            .context
            .event_publisher
            .publish(
                events::INTERRUPT_REGISTERED,
                json!({
                    "interrupt_id": interrupt.uuid,
                    "execution_uuid": interrupt.execution_uuid,
                    "interrupt_type": interrupt.interrupt_type,
                    "state_execution_instance_id": interrupt.state_execution_instance_id,
                    "cascaded": cascaded,
                }),
            )
            .await;
        log_interrupt_operation(
            "issue",
            interrupt.execution_uuid,
            &interrupt.interrupt_type.to_string(),
            "accepted",
        );
        Ok(())
    }

    async fn record_effect(&self, interrupt: &ExecutionInterrupt, state_id: Uuid) -> DeployResult<()> {
        let Some(mut instance) = self.context.store.get_state_instance(state_id).await? else {
            return Err(DeployError::NotFound(format!("State instance {state_id} not found")));
        };
        if instance.execution_uuid != interrupt.execution_uuid {
            return Err(DeployError::Validation(format!(
                "State instance {state_id} does not belong to execution {}",
                interrupt.execution_uuid
            )));
        }
        instance.interrupt_history.push(InterruptEffect {
            interrupt_id: interrupt.uuid,
            interrupt_type: interrupt.interrupt_type,
            applied_at: Utc::now(),
        });
        self.context.store.save_state_instance(&instance).await?;
        Ok(())
    }

    /// Non-final nested executions referenced from env-stage instances
    async fn running_children(&self, pipeline: &WorkflowExecution) -> DeployResult<Vec<Uuid>> {
        let instances = self.context.store.list_state_instances(pipeline.uuid).await?;
        let mut seen = HashSet::new();
        let mut children = Vec::new();
        for child_id in instances.iter().filter_map(|i| i.child_execution_id()) {
            if !seen.insert(child_id) {
                continue;
            }
            match self.context.store.get_execution(&pipeline.app_id, child_id).await {
                Ok(Some(child)) if !child.status.is_final() => children.push(child_id),
                Ok(Some(_)) => {}
                Ok(None) => warn!(child_execution = %child_id, "Nested execution not found"),
                Err(e) => warn!(child_execution = %child_id, error = %e, "Failed to load nested execution"),
            }
        }
        Ok(children)
    }

    pub async fn shutdown(&self) -> DeployResult<()> {
        self.fanout.shutdown().await
    }
}

/// Reject interrupts the execution can no longer or not yet accept
pub fn validate_interrupt(
    execution: &WorkflowExecution,
    interrupt: &ExecutionInterrupt,
) -> DeployResult<()> {
    if execution.status.is_final() {
        return Err(DeployError::AlreadyCompleted {
            execution_uuid: execution.uuid,
        });
    }
    if execution.status == ExecutionStatus::Preparing && interrupt.interrupt_type.is_pause() {
        return Err(DeployError::InvalidInterrupt(format!(
            "{} is not allowed while artifacts are being prepared",
            interrupt.interrupt_type
        )));
    }
    if execution.is_pipeline() && !interrupt.interrupt_type.is_pipeline_level() {
        return Err(DeployError::InvalidInterrupt(format!(
            "{} is not supported for pipeline executions",
            interrupt.interrupt_type
        )));
    }
    Ok(())
}

/// Status shown for an invalidated graph until it is recomputed
fn status_hint(interrupt_type: ExecutionInterruptType) -> Option<ExecutionStatus> {
    match interrupt_type {
        ExecutionInterruptType::Pause | ExecutionInterruptType::PauseAll => {
            Some(ExecutionStatus::Pausing)
        }
        ExecutionInterruptType::Resume | ExecutionInterruptType::ResumeAll => {
            Some(ExecutionStatus::Running)
        }
        ExecutionInterruptType::AbortAll => Some(ExecutionStatus::Discontinuing),
        ExecutionInterruptType::Rollback
        | ExecutionInterruptType::RollbackProvisionerAfterPhases => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WorkflowType;
    use crate::models::ExecutionArgs;

    fn execution(workflow_type: WorkflowType, status: ExecutionStatus) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(
            "app",
            "acc",
            "wf",
            "deploy",
            workflow_type,
            ExecutionArgs::default(),
        );
        execution.status = status;
        execution
    }

    #[test]
    fn final_executions_accept_nothing() {
        let exec = execution(WorkflowType::Orchestration, ExecutionStatus::Success);
        let interrupt = ExecutionInterrupt::new("app", exec.uuid, ExecutionInterruptType::Resume);
        assert!(matches!(
            validate_interrupt(&exec, &interrupt),
            Err(DeployError::AlreadyCompleted { .. })
        ));
    }

    #[test]
    fn pause_is_refused_while_preparing() {
        let exec = execution(WorkflowType::Orchestration, ExecutionStatus::Preparing);
        for kind in [ExecutionInterruptType::Pause, ExecutionInterruptType::PauseAll] {
            let interrupt = ExecutionInterrupt::new("app", exec.uuid, kind);
            assert!(matches!(
                validate_interrupt(&exec, &interrupt),
                Err(DeployError::InvalidInterrupt(_))
            ));
        }
        let abort = ExecutionInterrupt::new("app", exec.uuid, ExecutionInterruptType::AbortAll);
        assert!(validate_interrupt(&exec, &abort).is_ok());
    }

    #[test]
    fn pipelines_only_take_all_variants() {
        let exec = execution(WorkflowType::Pipeline, ExecutionStatus::Running);
        let pause = ExecutionInterrupt::new("app", exec.uuid, ExecutionInterruptType::Pause);
        assert!(validate_interrupt(&exec, &pause).is_err());
        let pause_all = ExecutionInterrupt::new("app", exec.uuid, ExecutionInterruptType::PauseAll);
        assert!(validate_interrupt(&exec, &pause_all).is_ok());
    }
}
