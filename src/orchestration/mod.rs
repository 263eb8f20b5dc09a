//! # Orchestration Engine
//!
//! Runs batches of document units through the pipeline.
//!
//! ## Architecture
//!
//! The orchestrator owns no pipeline knowledge of its own:
//! - **Routing** comes from the [`crate::routing::RoutingRegistry`]
//! - **Legality** of every commit is checked by the [`crate::state_machine::UnitStateMachine`]
//! - **Durability** is the [`crate::manifest::ManifestStore`]'s job
//! - **Failure handling** is decided by the [`ErrorPolicyEngine`]
//!
//! ## Core Components
//!
//! - **Orchestrator**: adoption, recovery, dispatch and the per-unit drive loop
//! - **StageRunner**: classify, extract, convert and normalize against a unit directory
//! - **RecoveryEngine**: repairs interrupted and stranded units before dispatch
//! - **ResourcePool**: worker slots and converter slots with bounded waits
//! - **ErrorPolicyEngine**: retry/quarantine/skip per error kind

pub mod error_policy;
pub mod orchestrator;
pub mod recovery;
pub mod resource_pool;
pub mod stages;
pub mod summary;

pub use error_policy::{ErrorPolicyEngine, PolicyDecision};
pub use orchestrator::Orchestrator;
pub use recovery::{RecoveryAction, RecoveryEngine, RecoveryReport};
pub use resource_pool::ResourcePool;
pub use stages::{StageCompletion, StageFailure, StageResult, StageRunner, StagedChanges};
pub use summary::{Summary, UnitOutcome, UnitReport};
