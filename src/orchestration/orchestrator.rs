//! # Orchestrator
//!
//! Drives every unit of a batch from adoption to a terminal area.
//!
//! ## Run Lifecycle
//!
//! 1. **Adopt**: each directory under the batch root is moved into the
//!    processing area and given a manifest.
//! 2. **Recover**: interrupted attempts and stranded units left by an
//!    earlier run are repaired before anything is dispatched.
//! 3. **Drive**: every non-terminal unit gets its own task. A task loops
//!    over load, route, attempt and commit until the unit is placed,
//!    deferred or aborted. Stage execution is bounded by the worker pool;
//!    units are independent, so one unit's failure never stops the batch.
//!    Staged stage output is promoted into the unit only after the
//!    completion commit, and drift found along the way is reconciled.
//! 4. **Drain**: outstanding metadata syncs finish (or time out) before the
//!    summary is returned.
//!
//! Every step is driven by the manifest on disk, so a run can stop at any
//! point and the next run resumes where this one left off.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error_policy::{ErrorPolicyEngine, PolicyDecision};
use super::recovery::RecoveryEngine;
use super::resource_pool::ResourcePool;
use super::stages::{StageCompletion, StageFailure, StageRunner};
use super::summary::{Summary, UnitOutcome};
use crate::capabilities::{Capabilities, ExtractionLimits, MetadataSync};
use crate::config::{ConfigurationError, PipelineConfig};
use crate::constants::{areas, resources};
use crate::decision::{DecisionEngine, TypeCatalog};
use crate::error::{PipelineError, Result};
use crate::logging::{log_error, log_stage_operation, log_unit_operation};
use crate::manifest::{
    carry_forward, scan_inventory_async, verify_inventory, ErrorRecord, FsManifestStore,
    Manifest, ManifestMutation, ManifestStore, UnitId,
};
use crate::resilience::CircuitBreakerManager;
use crate::routing::{Destination, Route, RouteOutcome, RoutingError, RoutingRegistry};
use crate::state_machine::{Stage, Transition, UnitEvent, UnitState, UnitStateMachine};

/// Shortest wait before re-checking an open breaker
const CIRCUIT_RECHECK_FLOOR: Duration = Duration::from_millis(50);

/// Batch orchestrator
///
/// Holds the validated configuration, routing table and capabilities; each
/// [`Orchestrator::run`] builds its own store and worker pool on top.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    registry: Arc<RoutingRegistry>,
    capabilities: Capabilities,
    decision: Arc<DecisionEngine>,
    breakers: Arc<CircuitBreakerManager>,
    policy: Arc<ErrorPolicyEngine>,
    cancellation: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator; configuration problems surface here, before any unit is touched
    pub fn new(
        config: PipelineConfig,
        registry: RoutingRegistry,
        capabilities: Capabilities,
    ) -> Result<Self> {
        config.validate()?;

        let decision = Arc::new(DecisionEngine::new(TypeCatalog::from_config(&config.types)));
        let breakers = Arc::new(CircuitBreakerManager::from_settings(&config.circuit_breakers));
        let policy = Arc::new(ErrorPolicyEngine::new(config.error_policy.clone()));

        info!(
            workers = config.execution.worker_count,
            max_cycles = config.execution.max_cycles,
            resource_slots = config.execution.resource_slots,
            routes = registry.len(),
            "🚀 Orchestrator initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            capabilities,
            decision,
            breakers,
            policy,
            cancellation: CancellationToken::new(),
        })
    }

    /// Default configuration with the standard routing table
    pub fn with_defaults(capabilities: Capabilities) -> Result<Self> {
        Self::new(
            PipelineConfig::default(),
            RoutingRegistry::standard()?,
            capabilities,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    /// Token that stops dispatching new stage attempts when cancelled
    ///
    /// In-flight attempts still commit; untouched units stay non-terminal
    /// and resume on the next run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// [`Orchestrator::run`] with the configured cycle budget and worker count
    pub async fn run_batch(&self, batch_root: &Path, destination_root: &Path) -> Result<Summary> {
        self.run(
            batch_root,
            destination_root,
            self.config.execution.max_cycles,
            self.config.execution.worker_count,
        )
        .await
    }

    /// Process every unit under `batch_root` into `destination_root`
    ///
    /// Returns `Err` only for batch-level failures (invalid arguments, an
    /// unreadable batch root). Per-unit failures are reported in the summary.
    #[instrument(skip(self), fields(run_id = tracing::field::Empty, batch_root = %batch_root.display(), destination_root = %destination_root.display()))]
    pub async fn run(
        &self,
        batch_root: &Path,
        destination_root: &Path,
        max_cycles: u32,
        worker_count: usize,
    ) -> Result<Summary> {
        let started = Instant::now();
        if max_cycles == 0 {
            return Err(ConfigurationError::invalid_value(
                "max_cycles",
                max_cycles,
                "must be at least 1",
            )
            .into());
        }
        if worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_count",
                worker_count,
                "must be at least 1",
            )
            .into());
        }

        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let machine = UnitStateMachine::new(max_cycles)?;
        let store = Arc::new(FsManifestStore::new(destination_root));

        let adopted = self.adopt(batch_root, &store).await?;
        info!(adopted = adopted.len(), "📥 Batch adopted");

        let recovery = RecoveryEngine::new(store.clone(), machine, destination_root);
        let report = recovery.recover().await?;

        let mut summary = Summary {
            run_id,
            ..Summary::default()
        };
        for unit_id in report.quarantined.iter().chain(report.relocated.iter()) {
            match store.load(unit_id).await {
                Ok(manifest) => summary.record(
                    unit_id.clone(),
                    UnitOutcome::Terminal {
                        state: manifest.state,
                    },
                ),
                Err(err) => summary.record(
                    unit_id.clone(),
                    UnitOutcome::Aborted {
                        reason: err.to_string(),
                    },
                ),
            }
        }
        summary.recovery = report;

        let mut units = Vec::new();
        let mut listing = store.list_non_terminal();
        while let Some(listed) = listing.next().await {
            match listed {
                Ok(unit_id) => units.push(unit_id),
                Err(err) => {
                    log_error("orchestrator", "list_units", &err.to_string(), None);
                    summary.aborted += 1;
                }
            }
        }
        drop(listing);

        let driver = Arc::new(UnitDriver {
            store: store.clone(),
            registry: Arc::clone(&self.registry),
            machine,
            decision: Arc::clone(&self.decision),
            policy: Arc::clone(&self.policy),
            runner: StageRunner::new(
                self.capabilities.clone(),
                Arc::clone(&self.decision),
                Arc::clone(&self.breakers),
                ResourcePool::new(
                    resources::CONVERTER_SLOTS,
                    self.config.execution.resource_slots,
                    self.config.execution.resource_acquire_timeout(),
                ),
                ExtractionLimits::from(&self.config.extraction),
            ),
            recovery,
            workers: ResourcePool::new(
                resources::WORKER_SLOTS,
                worker_count,
                self.config.execution.resource_acquire_timeout(),
            ),
            metadata_sync: Arc::clone(&self.capabilities.metadata_sync),
            sync_timeout: self.config.execution.metadata_sync_timeout(),
            sync_tasks: Mutex::new(JoinSet::new()),
            in_flight: DashSet::new(),
            cancellation: self.cancellation.clone(),
        });

        info!(
            units = units.len(),
            workers = worker_count,
            max_cycles = max_cycles,
            "⚙️ Dispatching units"
        );

        let mut tasks = JoinSet::new();
        for unit_id in units {
            let driver = Arc::clone(&driver);
            tasks.spawn(async move {
                let outcome = driver.drive(&unit_id).await;
                (unit_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((unit_id, outcome)) => summary.record(unit_id, outcome),
                Err(join_error) => {
                    error!(error = %join_error, "❌ Unit task panicked");
                    summary.processed += 1;
                    summary.aborted += 1;
                }
            }
        }

        driver.drain_metadata_sync().await;
        summary.elapsed = started.elapsed();

        info!(
            processed = summary.processed,
            ready = summary.ready,
            quarantined = summary.quarantined(),
            deferred = summary.deferred,
            aborted = summary.aborted,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "🏁 Batch complete"
        );

        let breakers = self.breakers.system_metrics();
        for (name, metrics) in &breakers.circuit_breakers {
            debug!(breaker = %name, metrics = %metrics.format_summary(), "Circuit breaker totals");
        }
        if !breakers.open_circuits().is_empty() {
            warn!(open = ?breakers.open_circuits(), "⚡ Circuits still open at end of batch");
        }
        Ok(summary)
    }

    /// Current manifest of a unit, wherever it lives under `destination_root`
    pub async fn inspect(&self, destination_root: &Path, unit_id: &UnitId) -> Result<Manifest> {
        Ok(FsManifestStore::new(destination_root).load(unit_id).await?)
    }

    /// Move batch directories into the processing area and create their manifests
    ///
    /// Directories already in the processing area without a manifest (a crash
    /// between move and create) are adopted too.
    async fn adopt(&self, batch_root: &Path, store: &FsManifestStore) -> Result<Vec<UnitId>> {
        let processing = store.processing_dir();
        tokio::fs::create_dir_all(&processing).await?;

        let reserved: Vec<PathBuf> = [areas::PROCESSING, areas::READY, areas::QUARANTINE]
            .into_iter()
            .map(|area| store.root().join(area))
            .collect();

        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(batch_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if reserved.contains(&path) {
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                warn!(path = %path.display(), "Ignoring loose file at batch root");
                continue;
            }
            candidates.push(entry.file_name().to_string_lossy().into_owned());
        }
        candidates.sort();

        for name in &candidates {
            let target = processing.join(name);
            if tokio::fs::try_exists(&target).await? {
                warn!(unit_id = %name, "Unit already in processing area, leaving batch copy in place");
                continue;
            }
            tokio::fs::rename(batch_root.join(name), &target).await?;
        }

        let mut adopted = Vec::new();
        let mut orphans = tokio::fs::read_dir(&processing).await?;
        while let Some(entry) = orphans.next_entry().await? {
            if !entry.file_type().await?.is_dir()
                || tokio::fs::try_exists(entry.path().join(crate::constants::MANIFEST_FILE_NAME))
                    .await?
            {
                continue;
            }

            let unit_id = UnitId::new(entry.file_name().to_string_lossy().into_owned());
            match store.create(&unit_id).await {
                Ok(manifest) => {
                    log_unit_operation(
                        "adopt",
                        unit_id.as_str(),
                        Some(manifest.state.to_string().as_str()),
                        Some(0),
                        Some(format!("{} files", manifest.inventory.len()).as_str()),
                    );
                    adopted.push(unit_id);
                }
                Err(err) => {
                    log_error("orchestrator", "adopt", &err.to_string(), Some(unit_id.as_str()));
                }
            }
        }
        adopted.sort();
        Ok(adopted)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("routes", &self.registry.len())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Result of one pass of a unit's drive loop
enum Step {
    Continue,
    Finished(UnitState),
    Deferred,
}

/// Per-run state shared by all unit tasks
struct UnitDriver {
    store: Arc<dyn ManifestStore>,
    registry: Arc<RoutingRegistry>,
    machine: UnitStateMachine,
    decision: Arc<DecisionEngine>,
    policy: Arc<ErrorPolicyEngine>,
    runner: StageRunner,
    recovery: RecoveryEngine,
    workers: ResourcePool,
    metadata_sync: Arc<dyn MetadataSync>,
    sync_timeout: Duration,
    sync_tasks: Mutex<JoinSet<()>>,
    in_flight: DashSet<UnitId>,
    cancellation: CancellationToken,
}

impl UnitDriver {
    async fn drive(&self, unit_id: &UnitId) -> UnitOutcome {
        if !self.in_flight.insert(unit_id.clone()) {
            warn!(unit_id = %unit_id, "Unit already in flight, not dispatching twice");
            return UnitOutcome::Deferred { state: None };
        }

        let outcome = self.drive_until_settled(unit_id).await;
        self.in_flight.remove(unit_id);
        outcome
    }

    /// Reconciliations allowed per unit and run
    ///
    /// Every reconciliation sends the unit back through classification, so
    /// more than the cycle budget allows cannot make progress.
    fn reconcile_limit(&self) -> u32 {
        self.machine.max_cycles().saturating_add(1)
    }

    async fn drive_until_settled(&self, unit_id: &UnitId) -> UnitOutcome {
        let mut reconciliations = 0u32;

        loop {
            match self.step(unit_id).await {
                Ok(Step::Continue) => {}
                Ok(Step::Finished(state)) => return UnitOutcome::Terminal { state },
                Ok(Step::Deferred) | Err(PipelineError::Cancelled) => {
                    let state = self.store.load(unit_id).await.ok().map(|m| m.state);
                    info!(unit_id = %unit_id, state = ?state, "⏸️ Unit deferred");
                    return UnitOutcome::Deferred { state };
                }
                Err(PipelineError::ManifestInconsistency { detail, .. })
                    if reconciliations < self.reconcile_limit() =>
                {
                    reconciliations += 1;
                    warn!(
                        unit_id = %unit_id,
                        drift = %detail,
                        reconciliation = reconciliations,
                        "Manifest out of sync with unit files, reconciling"
                    );
                    if let Err(err) = self.recovery.reconcile_unit(unit_id).await {
                        return Self::abort(unit_id, &err);
                    }
                }
                Err(err) => return Self::abort(unit_id, &err),
            }
        }
    }

    fn abort(unit_id: &UnitId, err: &PipelineError) -> UnitOutcome {
        log_error("orchestrator", "drive_unit", &err.to_string(), Some(unit_id.as_str()));
        UnitOutcome::Aborted {
            reason: err.to_string(),
        }
    }

    async fn step(&self, unit_id: &UnitId) -> Result<Step> {
        if self.cancellation.is_cancelled() {
            return Ok(Step::Deferred);
        }

        let manifest = self.store.load(unit_id).await?;
        if manifest.state.is_terminal() {
            return self.finish(&manifest).await;
        }

        let outcome = self.next_outcome(&manifest);
        let route = self.registry.resolve(manifest.state, outcome)?;
        debug!(
            unit_id = %unit_id,
            state = %manifest.state,
            outcome = %outcome,
            destination = %route.destination,
            "Routing decision"
        );

        match route.stage() {
            Some(stage) => self.attempt_stage(manifest, stage).await,
            None => self.take_terminal_route(&manifest, outcome, route).await,
        }
    }

    /// Outcome for the next routing decision
    fn next_outcome(&self, manifest: &Manifest) -> RouteOutcome {
        if let Some(pending) = manifest.pending_outcome {
            return pending;
        }

        match manifest.state {
            UnitState::Input => RouteOutcome::Admitted,
            UnitState::Classified => self.decision.route_outcome(&manifest.inventory),
            UnitState::Extracted | UnitState::Converted => RouteOutcome::StageCompleted,
            UnitState::Normalized => self.decision.classify_unit(&manifest.inventory).outcome(),
            // Terminal units never reach routing
            UnitState::Ready | UnitState::Quarantined(_) => RouteOutcome::StageCompleted,
        }
    }

    /// Commit a placement route (merge or quarantine) and move the unit
    ///
    /// Empty and ambiguous units carry an error record saying why they were
    /// quarantined.
    async fn take_terminal_route(
        &self,
        manifest: &Manifest,
        outcome: RouteOutcome,
        route: Route,
    ) -> Result<Step> {
        let event = route.event().ok_or_else(|| RoutingError::Unrouted {
            state: manifest.state.to_string(),
            outcome: route.destination.to_string(),
        })?;
        let transition = self.machine.apply(&manifest.snapshot(), &event)?;
        let relative = route
            .destination
            .relative_dir(manifest.unit_id.as_str(), manifest.dominant_type.as_deref());

        let mut mutation = ManifestMutation::new(transition).with_destination(relative);
        if let Some(verdict) = Self::classification_verdict(manifest, outcome) {
            if let Some(kind) = verdict.error_kind() {
                let stage = Stage::producing(manifest.state).unwrap_or(Stage::Classify);
                let attempt = manifest.next_attempt(stage, None);
                mutation = mutation.with_error(ErrorRecord::new(
                    kind,
                    stage,
                    verdict.to_string(),
                    attempt,
                ));
            }
        }

        let committed = self.store.commit(&manifest.unit_id, mutation).await?;

        log_unit_operation(
            "place",
            committed.unit_id.as_str(),
            Some(committed.state.to_string().as_str()),
            Some(committed.cycle_count),
            committed.destination.as_deref(),
        );
        self.finish(&committed).await
    }

    /// Error explaining a quarantine the classification itself decided
    fn classification_verdict(manifest: &Manifest, outcome: RouteOutcome) -> Option<PipelineError> {
        let files = manifest.inventory.len();
        match outcome {
            RouteOutcome::Empty => Some(PipelineError::EmptyContent(format!(
                "{files} files, none with content besides archives"
            ))),
            RouteOutcome::Ambiguous => Some(PipelineError::AmbiguousClassification(format!(
                "{files} files, none with a known type"
            ))),
            _ => None,
        }
    }

    /// Relocate a terminal unit and hand it to metadata sync
    async fn finish(&self, manifest: &Manifest) -> Result<Step> {
        self.recovery.place(manifest).await?;
        self.dispatch_metadata_sync(manifest.clone());
        Ok(Step::Finished(manifest.state))
    }

    async fn attempt_stage(&self, manifest: Manifest, stage: Stage) -> Result<Step> {
        if stage == Stage::Classify {
            let transition = self.machine.apply(&manifest.snapshot(), &UnitEvent::Classify)?;
            if transition.forced {
                return self.commit_forced(&manifest, transition).await;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => return Ok(Step::Deferred),
            permit = self.workers.acquire_unbounded() => permit?,
        };

        let unit_dir = self.store.unit_dir(&manifest.unit_id).await?;
        verify_inventory(&manifest, &unit_dir).await?;

        let attempt = u32::try_from(manifest.failures_in_cycle(stage).count())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let transition = self
            .machine
            .apply(&manifest.snapshot(), &UnitEvent::StageStarted(stage))?;
        let started = self
            .store
            .commit(&manifest.unit_id, ManifestMutation::new(transition))
            .await?;
        log_stage_operation(
            "stage_attempt",
            started.unit_id.as_str(),
            stage.as_str(),
            attempt,
            "started",
            None,
        );

        let result = self.runner.run(stage, &started, &unit_dir).await;
        drop(permit);

        match result {
            Ok(completion) => {
                self.complete_stage(&started, stage, attempt, &unit_dir, completion)
                    .await
            }
            Err(StageFailure::CircuitOpen {
                operation,
                retry_after,
            }) => {
                let transition = self
                    .machine
                    .apply(&started.snapshot(), &UnitEvent::StageFailed(stage))?;
                self.store
                    .commit(&started.unit_id, ManifestMutation::new(transition))
                    .await?;
                warn!(
                    unit_id = %started.unit_id,
                    stage = %stage,
                    operation = %operation,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "⚡ Circuit open, deferring stage"
                );
                Ok(self.pause(retry_after.max(CIRCUIT_RECHECK_FLOOR)).await)
            }
            Err(StageFailure::Failed {
                error,
                permanent,
                subject,
            }) => {
                self.handle_failure(&started, stage, error, permanent, subject)
                    .await
            }
        }
    }

    async fn complete_stage(
        &self,
        started: &Manifest,
        stage: Stage,
        attempt: u32,
        unit_dir: &Path,
        completion: StageCompletion,
    ) -> Result<Step> {
        let transition = self
            .machine
            .apply(&started.snapshot(), &UnitEvent::completion_of(stage))?;

        let mut mutation = ManifestMutation::new(transition).with_inventory(completion.inventory);
        if let Some(outcome) = completion.pending_outcome {
            mutation = mutation.with_pending_outcome(outcome);
        }
        if let Some(dominant_type) = completion.dominant_type {
            mutation = mutation.with_dominant_type(dominant_type);
        }
        if let Some(destination) = Destination::for_terminal_state(transition.to, None) {
            mutation = mutation
                .with_destination(destination.relative_dir(started.unit_id.as_str(), None));
        }

        let committed = self.store.commit(&started.unit_id, mutation).await?;
        log_stage_operation(
            "stage_attempt",
            committed.unit_id.as_str(),
            stage.as_str(),
            attempt,
            "completed",
            None,
        );

        if !completion.staged.is_empty() {
            completion.staged.apply(unit_dir).await.map_err(|err| {
                PipelineError::ManifestInconsistency {
                    unit_id: committed.unit_id.to_string(),
                    detail: format!("promoting staged {stage} output failed: {err}"),
                }
            })?;
            debug!(
                unit_id = %committed.unit_id,
                stage = %stage,
                promoted = completion.staged.promotions.len(),
                "Staged output promoted"
            );
        }

        if committed.state.is_terminal() {
            return self.finish(&committed).await;
        }
        Ok(Step::Continue)
    }

    /// Commit a quarantine the state machine forced on a cycle-back
    async fn commit_forced(&self, manifest: &Manifest, transition: Transition) -> Result<Step> {
        let relative = Destination::for_terminal_state(transition.to, None)
            .map(|destination| destination.relative_dir(manifest.unit_id.as_str(), None));
        let mut mutation = ManifestMutation::new(transition);
        if let Some(relative) = relative {
            mutation = mutation.with_destination(relative);
        }

        let committed = self.store.commit(&manifest.unit_id, mutation).await?;
        warn!(
            unit_id = %committed.unit_id,
            cycle = committed.cycle_count,
            state = %committed.state,
            "🔁 Cycle budget exhausted, unit quarantined"
        );
        self.finish(&committed).await
    }

    async fn handle_failure(
        &self,
        started: &Manifest,
        stage: Stage,
        error: PipelineError,
        permanent: bool,
        subject: Option<String>,
    ) -> Result<Step> {
        let Some(kind) = error.error_kind() else {
            if matches!(error, PipelineError::Cancelled) {
                let transition = self
                    .machine
                    .apply(&started.snapshot(), &UnitEvent::StageFailed(stage))?;
                self.store
                    .commit(&started.unit_id, ManifestMutation::new(transition))
                    .await?;
            }
            return Err(error);
        };

        let attempt = started.next_attempt(stage, subject.as_deref());
        let decision = self.policy.decide(kind, attempt, stage, permanent);
        let message = error.to_string();

        let transition = self
            .machine
            .apply(&started.snapshot(), &UnitEvent::StageFailed(stage))?;
        let mut mutation = ManifestMutation::new(transition)
            .with_error(ErrorRecord::new(kind, stage, message.clone(), attempt).concerning(subject));
        if matches!(decision, PolicyDecision::Quarantine(_)) {
            mutation = mutation.with_pending_outcome(RouteOutcome::Failed(kind));
        }
        let failed = self.store.commit(&started.unit_id, mutation).await?;

        log_stage_operation(
            "stage_attempt",
            failed.unit_id.as_str(),
            stage.as_str(),
            attempt,
            "failed",
            Some(message.as_str()),
        );

        match decision {
            PolicyDecision::Retry(delay) => {
                debug!(
                    unit_id = %failed.unit_id,
                    stage = %stage,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying stage after backoff"
                );
                Ok(self.pause(delay).await)
            }
            PolicyDecision::Quarantine(bucket) => {
                warn!(
                    unit_id = %failed.unit_id,
                    stage = %stage,
                    error_kind = %kind,
                    quarantine = %bucket,
                    "🚫 Error policy gave up on unit"
                );
                Ok(Step::Continue)
            }
            PolicyDecision::Skip => self.skip_stage(&failed, stage).await,
        }
    }

    /// Treat a failed stage as complete with the unit as it stands
    async fn skip_stage(&self, failed: &Manifest, stage: Stage) -> Result<Step> {
        let unit_dir = self.store.unit_dir(&failed.unit_id).await?;
        let scanned = scan_inventory_async(&unit_dir).await?;
        let inventory = carry_forward(&failed.inventory, scanned, stage);

        let transition = self
            .machine
            .apply(&failed.snapshot(), &UnitEvent::completion_of(stage))?;
        self.store
            .commit(
                &failed.unit_id,
                ManifestMutation::new(transition).with_inventory(inventory),
            )
            .await?;

        warn!(unit_id = %failed.unit_id, stage = %stage, "⏭️ Stage skipped after failure");
        Ok(Step::Continue)
    }

    async fn pause(&self, delay: Duration) -> Step {
        tokio::select! {
            _ = self.cancellation.cancelled() => Step::Deferred,
            _ = tokio::time::sleep(delay) => Step::Continue,
        }
    }

    fn dispatch_metadata_sync(&self, manifest: Manifest) {
        let sync = Arc::clone(&self.metadata_sync);
        let limit = self.sync_timeout;

        self.sync_tasks.lock().spawn(async move {
            match timeout(limit, sync.sync(&manifest)).await {
                Ok(Ok(())) => debug!(unit_id = %manifest.unit_id, "Metadata synced"),
                Ok(Err(err)) => warn!(
                    unit_id = %manifest.unit_id,
                    error = %err,
                    "Metadata sync failed, placement unaffected"
                ),
                Err(_elapsed) => warn!(
                    unit_id = %manifest.unit_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Metadata sync timed out, placement unaffected"
                ),
            }
        });
    }

    async fn drain_metadata_sync(&self) {
        let mut tasks = std::mem::take(&mut *self.sync_tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(join_error) = joined {
                warn!(error = %join_error, "Metadata sync task panicked");
            }
        }
    }
}
