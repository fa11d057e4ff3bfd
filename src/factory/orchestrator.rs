//! Build Lifecycle & State Machine (spec §4.1): `BuildRegistry` tracks the
//! live in-memory handles (Event Bus, Gate Controller, pause/cancel
//! signal) for every build running on this node; `Orchestrator` exposes
//! `StartBuild`/`PauseBuild`/`ResumeBuild`/`CancelBuild`/`ApproveGate` and
//! owns the one-task-per-build driver that runs Planning -> Sequential ->
//! Parallel -> Artifact Pipeline in sequence, with a single top-level
//! recovery boundary that converts any uncaught error into FAILED plus
//! one `error` event.
//!
//! Grounded in the teacher's `api::AppState`/`PipelineRunner` split — one
//! shared registry plus a spawn-and-forget per-run task — and
//! `pipeline::is_valid_transition`'s match-tuple state table, generalized
//! from the five-state pipeline lifecycle to the full nine-state build
//! lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact;
use super::bus::EventBus;
use super::config::EVENT_BUS_RING_CAPACITY;
use super::context::{BuildContext, ControlHandle, ControlSignal};
use super::db::DbHandle;
use super::executor::{parallel, sequential};
use super::gates::GateController;
use super::manifest::ManifestWriter;
use super::models::{Build, BuildStatus, ComplexityTier, EventBody, Gate, LogLevel, Severity};
use super::object_store::ObjectStoreAdapter;
use super::persistence::PersistenceBuffer;
use super::planner::{self, Planner};
use super::sandbox::{DockerSandboxManager, SandboxConfig};
use super::sse::ActiveBuildRegistry;
use super::tool_bridge::ToolBridge;
use crate::errors::BuildError;

/// True if `to` is a legal next state from `from`, per the state machine
/// in spec §4.1. Generalizes `pipeline::is_valid_transition`'s five-state
/// match-tuple table to the full nine build states.
pub fn is_valid_transition(from: BuildStatus, to: BuildStatus) -> bool {
    use BuildStatus::*;
    matches!(
        (from, to),
        (Pending, Initializing)
            | (Initializing, Running)
            | (Initializing, Failed)
            | (Running, AwaitingDesignReview)
            | (AwaitingDesignReview, Running)
            | (Running, AwaitingFeatureReview)
            | (AwaitingFeatureReview, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Cancelled)
            | (AwaitingDesignReview, Cancelled)
            | (AwaitingFeatureReview, Cancelled)
    )
}

/// Live, node-local state for one build, held by the registry alongside
/// the durable `Build` record. Everything here is cheap to clone (all
/// `Arc`s) and is handed to the driver task and to HTTP handlers alike.
#[derive(Clone)]
pub struct BuildHandle {
    pub bus: Arc<EventBus>,
    pub gates: Arc<GateController>,
    pub control: Arc<ControlHandle>,
}

/// The in-memory registry of builds active on this node. Grounded in the
/// teacher's `AppState`'s single shared map; a plain `std::sync::RwLock`
/// is enough since every operation is a non-blocking map lookup (the
/// `ActiveBuildRegistry` trait it implements for the SSE streamer is
/// synchronous by design).
#[derive(Default)]
pub struct BuildRegistry {
    handles: StdRwLock<HashMap<Uuid, BuildHandle>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: Uuid, handle: BuildHandle) {
        self.handles.write().expect("build registry poisoned").insert(id, handle);
    }

    pub fn get(&self, id: Uuid) -> Option<BuildHandle> {
        self.handles.read().expect("build registry poisoned").get(&id).cloned()
    }

    fn remove(&self, id: Uuid) {
        self.handles.write().expect("build registry poisoned").remove(&id);
    }
}

impl ActiveBuildRegistry for BuildRegistry {
    fn active_bus(&self, build_id: Uuid) -> Option<Arc<EventBus>> {
        self.get(build_id).map(|handle| handle.bus)
    }
}

/// Body of `POST /builds`, per spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct StartBuildOptions {
    pub owner_id: String,
    #[serde(default)]
    pub complexity_tier: Option<ComplexityTier>,
    #[serde(default)]
    pub target_feature_count: Option<u32>,
    #[serde(default)]
    pub review_gates_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedBuild {
    pub build_id: Uuid,
}

/// Shared handles needed to provision a sandbox and run a build end to
/// end. Cheap to clone; one instance is held by the HTTP layer and handed
/// to every spawned driver task.
#[derive(Clone)]
pub struct Orchestrator {
    db: DbHandle,
    registry: Arc<BuildRegistry>,
    sandbox_manager: Arc<DockerSandboxManager>,
    sandbox_config: SandboxConfig,
    object_store: Option<Arc<dyn ObjectStoreAdapter>>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        registry: Arc<BuildRegistry>,
        sandbox_manager: Arc<DockerSandboxManager>,
        sandbox_config: SandboxConfig,
        object_store: Option<Arc<dyn ObjectStoreAdapter>>,
    ) -> Self {
        Self {
            db,
            registry,
            sandbox_manager,
            sandbox_config,
            object_store,
        }
    }

    pub fn registry(&self) -> Arc<BuildRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn object_store(&self) -> Option<Arc<dyn ObjectStoreAdapter>> {
        self.object_store.clone()
    }

    /// Cloned handle to the same underlying connection, for callers
    /// outside the lifecycle API (the SSE streamer's history/poll paths).
    pub fn db_handle(&self) -> DbHandle {
        self.db.clone()
    }

    /// Plain lookup, no lifecycle semantics — used by handlers that just
    /// need to read the current record (`GET /builds/:id`, download).
    pub async fn db_get_build(&self, id: Uuid) -> Result<Option<Build>, BuildError> {
        self.db.get_build(id).await.map_err(BuildError::Database)
    }

    async fn load(&self, id: Uuid) -> Result<Build, BuildError> {
        self.db
            .get_build(id)
            .await
            .map_err(BuildError::Database)?
            .ok_or(BuildError::BuildNotFound { id })
    }

    /// `StartBuild(appSpec, options) -> buildId`: create the durable
    /// record, register its live handles, and spawn the driver task.
    pub async fn start_build(&self, app_spec: String, options: StartBuildOptions) -> Result<Uuid, BuildError> {
        let (heuristic_tier, suggested) = planner::estimate_complexity(&app_spec);

        let mut build = Build::new(options.owner_id, app_spec.clone());
        build.review_gates_enabled = options.review_gates_enabled;
        build.complexity_tier = options.complexity_tier.unwrap_or(heuristic_tier);
        build.target_feature_count = options.target_feature_count.unwrap_or(suggested as u32);
        let build_id = build.id;

        self.db.create_build(&build).await.map_err(BuildError::Database)?;
        self.spawn_driver(build).await;
        Ok(build_id)
    }

    /// `PauseBuild(id)`: cooperative, next tool-call boundary. Idempotent
    /// if already paused; invalid from any other non-running state.
    pub async fn pause_build(&self, id: Uuid) -> Result<Build, BuildError> {
        let build = self.load(id).await?;
        match build.status {
            BuildStatus::Paused => Ok(build),
            BuildStatus::Running => {
                let handle = self.registry.get(id).ok_or(BuildError::BuildNotFound { id })?;
                handle.control.request_pause();
                self.db
                    .update_build_status(id, BuildStatus::Paused)
                    .await
                    .map_err(BuildError::Database)?;
                self.load(id).await
            }
            other => Err(BuildError::InvalidTransition { from: other, to: BuildStatus::Paused }),
        }
    }

    /// `ResumeBuild(id)`: reloads the manifest by simply letting the
    /// already-running driver task continue (the manifest was never
    /// unloaded, only the control signal blocked progress). Idempotent if
    /// already running.
    pub async fn resume_build(&self, id: Uuid) -> Result<Build, BuildError> {
        let build = self.load(id).await?;
        match build.status {
            BuildStatus::Running => Ok(build),
            BuildStatus::Paused => {
                let handle = self.registry.get(id).ok_or(BuildError::BuildNotFound { id })?;
                handle.control.request_resume();
                self.db
                    .update_build_status(id, BuildStatus::Running)
                    .await
                    .map_err(BuildError::Database)?;
                self.load(id).await
            }
            other => Err(BuildError::InvalidTransition { from: other, to: BuildStatus::Running }),
        }
    }

    /// `CancelBuild(id)`: signals the cooperative stop; the driver task
    /// performs the actual status transition once its current iteration
    /// finishes and the sandbox is destroyed (spec §5). Idempotent on an
    /// already-terminal build.
    pub async fn cancel_build(&self, id: Uuid) -> Result<Build, BuildError> {
        let build = self.load(id).await?;
        if build.status.is_terminal() {
            return Ok(build);
        }
        if let Some(handle) = self.registry.get(id) {
            handle.control.request_cancel();
        }
        Ok(build)
    }

    /// `ApproveGate(id, gate, ..)`: unblock a waiting
    /// `GateController::wait_for_approval`. Idempotent: a second approve
    /// for the same gate is a no-op (spec §8).
    pub async fn approve_gate(&self, id: Uuid, gate: Gate) -> Result<Build, BuildError> {
        let handle = self.registry.get(id).ok_or(BuildError::BuildNotFound { id })?;
        handle.gates.approve(gate);
        self.load(id).await
    }

    /// Reset a terminal build back to PENDING and run it again from
    /// scratch with the same spec and options. Idempotent (a no-op) while
    /// the build is still active.
    pub async fn restart_build(&self, id: Uuid) -> Result<Build, BuildError> {
        let build = self.load(id).await?;
        if !build.status.is_terminal() {
            return Ok(build);
        }

        let mut fresh = build.clone();
        fresh.status = BuildStatus::Pending;
        fresh.started_at = None;
        fresh.progress = super::models::Progress::zero();
        fresh.artifact_key = None;
        fresh.sandbox_id = None;
        fresh.output_url = None;

        self.db
            .update_build_status(id, BuildStatus::Pending)
            .await
            .map_err(BuildError::Database)?;
        self.db
            .update_build_progress(id, 0, 0)
            .await
            .map_err(BuildError::Database)?;
        self.spawn_driver(fresh).await;
        self.load(id).await
    }

    async fn spawn_driver(&self, build: Build) {
        let bus = Arc::new(EventBus::new(EVENT_BUS_RING_CAPACITY));
        let gates = Arc::new(GateController::new());
        let control = Arc::new(ControlHandle::new());
        self.registry.insert(
            build.id,
            BuildHandle {
                bus: Arc::clone(&bus),
                gates: Arc::clone(&gates),
                control: Arc::clone(&control),
            },
        );

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive(build, bus, gates, control).await;
        });
    }

    /// The per-build driver: provisions the sandbox, runs Planning,
    /// Sequential, and Parallel in sequence, then always runs the
    /// Artifact Pipeline before tearing down the live handles. Any
    /// uncaught error from a phase is this function's single recovery
    /// boundary (spec §7): it is logged as one `error` event and the
    /// build transitions to FAILED.
    async fn drive(
        &self,
        build: Build,
        bus: Arc<EventBus>,
        gates: Arc<GateController>,
        control: Arc<ControlHandle>,
    ) {
        let build_id = build.id;
        let persistence = Arc::new(PersistenceBuffer::spawn(self.db.clone(), build_id));

        let _ = self.db.update_build_status(build_id, BuildStatus::Initializing).await;

        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                self.fail_before_sandbox(build_id, &bus, &persistence, format!("failed to create build workdir: {err}"))
                    .await;
                self.registry.remove(build_id);
                return;
            }
        };

        let session = match self
            .sandbox_manager
            .spawn_session(build_id, workdir.path(), &self.sandbox_config)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.fail_before_sandbox(
                    build_id,
                    &bus,
                    &persistence,
                    format!("failed to provision sandbox: {err:#}"),
                )
                .await;
                self.registry.remove(build_id);
                return;
            }
        };
        let sandbox: Arc<dyn super::sandbox::SandboxAdapter> = Arc::new(session);

        let _ = self.db.update_build_sandbox_id(build_id, sandbox.get_host().as_deref()).await;
        if let Err(err) = sandbox.write_file("app_spec.txt", build.app_spec.as_bytes()).await {
            self.fail_before_sandbox(build_id, &bus, &persistence, format!("failed to write app spec: {err:#}"))
                .await;
            let _ = sandbox.destroy().await;
            self.registry.remove(build_id);
            return;
        }

        let _ = self.db.update_build_started_at(build_id, chrono::Utc::now()).await;
        let _ = self.db.update_build_status(build_id, BuildStatus::Running).await;

        let ctx = Arc::new(BuildContext {
            build_id,
            sandbox: Arc::clone(&sandbox),
            bus: Arc::clone(&bus),
            persistence: Arc::clone(&persistence),
            gates,
            control: Arc::clone(&control),
            db: self.db.clone(),
            review_gates_enabled: build.review_gates_enabled,
            local_dir: workdir.path().to_path_buf(),
        });
        let tool_bridge = Arc::new(ToolBridge::new(Arc::clone(&sandbox)));
        let ui_project = planner::detect_ui_project(&build.app_spec);

        let final_status = match self.run_phases(&ctx, &tool_bridge, &build.app_spec, ui_project).await {
            Ok(status) => status,
            Err(err) => {
                ctx.emit(EventBody::Error {
                    severity: Severity::Fatal,
                    message: format!("{err:#}"),
                    recoverable: false,
                })
                .await;
                ctx.log(LogLevel::Error, format!("build failed: {err:#}")).await;
                BuildStatus::Failed
            }
        };

        let artifact_key = artifact::capture_and_destroy(
            Arc::clone(&sandbox),
            self.object_store.clone(),
            build_id,
        )
        .await;

        let final_status = if final_status == BuildStatus::Completed
            && artifact_key.is_none()
            && self.object_store.is_some()
        {
            ctx.log(LogLevel::Error, "artifact capture failed; marking build failed".to_string())
                .await;
            BuildStatus::Failed
        } else {
            final_status
        };

        let _ = ctx.transition(final_status).await;
        let _ = self
            .db
            .complete_build(build_id, final_status, artifact_key.as_deref(), None)
            .await;

        persistence.shutdown(&self.db, build_id).await;
        self.registry.remove(build_id);
    }

    /// Run Planning -> Sequential -> Parallel, returning the terminal
    /// status to transition to. Cancellation observed at any checkpoint
    /// short-circuits the remaining phases.
    async fn run_phases(
        &self,
        ctx: &Arc<BuildContext>,
        tool_bridge: &Arc<ToolBridge>,
        app_spec: &str,
        ui_project: bool,
    ) -> Result<BuildStatus> {
        let manifest = Planner::run(ctx, tool_bridge, app_spec, ui_project).await?;
        if ctx.control.current() == ControlSignal::Cancelled {
            return Ok(BuildStatus::Cancelled);
        }

        let writer = Arc::new(ManifestWriter::spawn(manifest));

        sequential::run(ctx, tool_bridge, &writer).await?;
        if ctx.control.current() == ControlSignal::Cancelled {
            return Ok(BuildStatus::Cancelled);
        }

        parallel::run(Arc::clone(ctx), Arc::clone(tool_bridge), Arc::clone(&writer)).await?;
        if ctx.control.current() == ControlSignal::Cancelled {
            return Ok(BuildStatus::Cancelled);
        }

        let final_manifest = writer.snapshot().await?;
        if final_manifest.all_pass() {
            Ok(BuildStatus::Completed)
        } else {
            let (completed, total) = final_manifest.progress();
            ctx.log(
                LogLevel::Warn,
                format!("build finished with {completed}/{total} features passing; marking FAILED"),
            )
            .await;
            Ok(BuildStatus::Failed)
        }
    }

    /// A failure before the `BuildContext` exists yet (no sandbox to talk
    /// through): publish directly on the bus/persistence buffer and write
    /// FAILED straight to the durable store.
    async fn fail_before_sandbox(
        &self,
        build_id: Uuid,
        bus: &Arc<EventBus>,
        persistence: &Arc<PersistenceBuffer>,
        message: String,
    ) {
        let event = super::models::Event::new(
            build_id,
            EventBody::Error { severity: Severity::Fatal, message: message.clone(), recoverable: false },
        );
        bus.publish(super::models::BusItem::Event(event.clone()));
        persistence.push_event(event).await;
        let log = super::models::LogEntry::new(build_id, LogLevel::Error, message);
        bus.publish(super::models::BusItem::Log(log.clone()));
        persistence.push_log(log).await;

        let _ = self.db.update_build_status(build_id, BuildStatus::Failed).await;
        bus.publish(super::models::BusItem::terminal(build_id, BuildStatus::Failed));
        persistence.shutdown(&self.db, build_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_cover_the_happy_path() {
        use BuildStatus::*;
        assert!(is_valid_transition(Pending, Initializing));
        assert!(is_valid_transition(Initializing, Running));
        assert!(is_valid_transition(Running, Paused));
        assert!(is_valid_transition(Paused, Running));
        assert!(is_valid_transition(Running, Completed));
        assert!(is_valid_transition(Running, Cancelled));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        use BuildStatus::*;
        assert!(!is_valid_transition(Completed, Running));
        assert!(!is_valid_transition(Cancelled, Running));
        assert!(!is_valid_transition(Pending, Completed));
        assert!(!is_valid_transition(Paused, Completed));
    }

    #[test]
    fn registry_insert_get_remove_round_trips() {
        let registry = BuildRegistry::new();
        let id = Uuid::new_v4();
        let handle = BuildHandle {
            bus: Arc::new(EventBus::default()),
            gates: Arc::new(GateController::new()),
            control: Arc::new(ControlHandle::new()),
        };
        registry.insert(id, handle);
        assert!(registry.get(id).is_some());
        assert!(registry.active_bus(id).is_some());
        registry.remove(id);
        assert!(registry.get(id).is_none());
        assert!(registry.active_bus(id).is_none());
    }
}
