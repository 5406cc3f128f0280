//! # Collaborator Services
//!
//! Interfaces of the systems the orchestrator consumes but does not own, each
//! with an in-process implementation used by embedding applications and tests.

pub mod access;
pub mod barrier;
pub mod definitions;
pub mod output_store;
pub mod policy;
pub mod resource_constraint;
pub mod runtime;
pub mod wait_notify;

pub use access::{
    AuthorizationService, FeatureFlag, FeatureFlagEvaluator, StaticAuthorizationService,
    StaticFeatureFlags,
};
pub use barrier::{Barrier, BarrierParticipant, BarrierService, InMemoryBarrierService};
pub use definitions::{
    ArtifactResolver, DefinitionRepository, InMemoryDefinitionRepository,
    ParameterArtifactResolver,
};
pub use output_store::{InMemoryOutputStore, OutputScope, OutputVariableStore};
pub use policy::{
    AccountStatusChecker, AllowAll, DeploymentContext, DeploymentRateLimiter, FreezeWindow,
    FreezeWindowChecker, InstanceUsageLimiter, PolicyCheck, PolicyDecision, PolicyKind,
    PolicyRejection, PolicySet,
};
pub use resource_constraint::{
    InMemoryResourceConstraintService, PermitRequest, PermitState, ResourceConstraintService,
};
pub use runtime::{InProcessRuntime, RuntimeHandle, StateMachineRuntime};
pub use wait_notify::{InProcessWaitNotify, NotifyPayload, WaitNotify};
