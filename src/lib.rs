#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Deploy
//!
//! Execution orchestrator for continuous-delivery workflows and pipelines.
//!
//! ## Overview
//!
//! A deployment is a [`models::WorkflowExecution`]: either a single orchestration
//! workflow or a pipeline whose stages wrap nested workflow executions. This
//! crate admits new executions, tracks their status, accepts interrupts and
//! approval decisions, rolls deployments back on demand and serves cached,
//! watermarked views of their progress. The state machine runtime that actually
//! runs deployment steps sits behind [`services::StateMachineRuntime`].
//!
//! ## Module Organization
//!
//! - [`models`] - executions, state instances, interrupts, definitions
//! - [`state_machine`] - execution status lifecycle, state machine definitions,
//!   breakdown simulation
//! - [`store`] - execution store trait with in-memory and PostgreSQL backends
//! - [`services`] - collaborator interfaces (runtime, wait/notify, permits,
//!   barriers, policies, authorization)
//! - [`orchestration`] - admission, pipeline stages, approvals, interrupts,
//!   rollback, status and graph cache
//! - [`config`] - layered configuration
//! - [`events`] - fire-and-forget lifecycle events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_deploy::models::{CallerContext, ExecutionArgs};
//! use tasker_deploy::orchestration::WorkflowExecutionService;
//! use tasker_deploy::system_context::SystemContext;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = Arc::new(SystemContext::in_memory());
//! let service = WorkflowExecutionService::new(context);
//! let caller = CallerContext::user("account", "user-1", "Jane");
//! let execution = service
//!     .trigger_workflow_execution(&caller, "app", "workflow", ExecutionArgs::default())
//!     .await?;
//! println!("{} is {}", execution.uuid, execution.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;
pub mod store;
pub mod system_context;

pub use config::{ConfigManager, DeployConfig};
pub use constants::{ExecutionInterruptType, ExecutionStatus, StateType, WorkflowType};
pub use errors::{DeployError, DeployResult, StoreError};
pub use orchestration::WorkflowExecutionService;
pub use system_context::SystemContext;
