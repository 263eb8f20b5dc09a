#![allow(clippy::doc_markdown)] // Allow technical terms in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Unitflow Core
//!
//! Orchestration engine for document-unit pipelines.
//!
//! ## Overview
//!
//! A batch is a directory of units; each unit is a directory of files that
//! belong together (a case file, a mail export, an upload). The engine moves
//! every unit through classification, archive extraction, legacy-format
//! conversion and normalization until it lands in a `Ready` area grouped by
//! its dominant type, or in a `Quarantine` bucket explaining why it could not.
//!
//! ## Key Features
//!
//! - **Table-driven routing**: every `(state, outcome)` pair is declared and
//!   validated up front; nothing routes by ad-hoc conditionals
//! - **Bounded cycles**: units re-enter classification after extraction, but
//!   never more often than the configured budget
//! - **Crash safety**: every transition is an atomic manifest commit, and a
//!   restarted run recovers interrupted units before dispatch
//! - **Isolation**: units are processed concurrently under a worker pool;
//!   one unit's failure never affects another
//! - **Resilience**: extraction and conversion sit behind circuit breakers,
//!   conversion behind a bounded resource pool
//!
//! ## Module Organization
//!
//! - [`state_machine`] - Unit states, events and the transition table
//! - [`manifest`] - Durable per-unit records and inventory scanning
//! - [`routing`] - The routing registry
//! - [`decision`] - Classification of a unit's typed inventory
//! - [`resilience`] - Circuit breakers
//! - [`orchestration`] - Orchestrator, stage runners, recovery and error policy
//! - [`capabilities`] - Interfaces to detectors, extractors, converters and metadata sync
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use unitflow::{Capabilities, Orchestrator};
//!
//! # async fn example(capabilities: Capabilities) -> Result<(), Box<dyn std::error::Error>> {
//! unitflow::logging::init_structured_logging();
//!
//! let orchestrator = Orchestrator::with_defaults(capabilities)?;
//! let summary = orchestrator
//!     .run(Path::new("/data/incoming"), Path::new("/data/out"), 3, 4)
//!     .await?;
//!
//! println!("{}", summary.format_summary());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod constants;
pub mod decision;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod orchestration;
pub mod resilience;
pub mod routing;
pub mod state_machine;

pub use capabilities::{
    ArchiveExtractor, Capabilities, CapabilityError, DocumentConverter, ExtractionLimits,
    MetadataSync, NoopMetadataSync, TypeDetector, TypeLabel,
};
pub use config::{ConfigLoader, ConfigurationError, PipelineConfig};
pub use decision::{Classification, DecisionEngine, TypeCatalog};
pub use error::{ErrorKind, PipelineError, Result};
pub use manifest::{
    ErrorRecord, FsManifestStore, InventoryEntry, Manifest, ManifestError, ManifestMutation,
    ManifestStore, UnitId,
};
pub use orchestration::{
    ErrorPolicyEngine, Orchestrator, PolicyDecision, RecoveryEngine, RecoveryReport,
    ResourcePool, StageFailure, StageRunner, StagedChanges, Summary, UnitOutcome,
};
pub use resilience::{CircuitBreaker, CircuitBreakerManager, CircuitState, GuardedOperation};
pub use routing::{Destination, Route, RouteOutcome, RoutingError, RoutingRegistry};
pub use state_machine::{QuarantineKind, Stage, UnitEvent, UnitState, UnitStateMachine};
