//! Build Orchestrator — autonomous code-generation agent back-end.
//!
//! ## Overview
//!
//! A client posts an application spec; the orchestrator plans a feature
//! manifest, drives an LLM agent through staged phases inside a
//! per-build Docker sandbox, executes the agent's tool calls against
//! that sandbox, and fans out progress as both a durable event log and
//! a live SSE stream. On completion the sandbox's workspace is zipped
//! into object storage and the build exposes a signed download URL.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, OrchestratorConfig)    │
//! │          │ <─────── │    └─ api.rs  (route handlers, SharedState)      │
//! └──────────┘   SSE    │         │                                        │
//!                       │         │ Orchestrator::start_build()            │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (BuildRegistry, drive loop)    │
//!                       │         │                                        │
//!                       │         │ Planner::plan() → FeatureManifest      │
//!                       │         │ executor::{sequential, parallel}       │
//!                       │         v                                        │
//!                       │  llm.rs  (ConversationDriver, ClaudeProcess)     │
//!                       │         │                                        │
//!                       │         │ tool_bridge::execute() per tool call   │
//!                       │         v                                        │
//!                       │  sandbox.rs   (DockerSandboxManager, SandboxAdapter) │
//!                       │         │                                        │
//!                       │         │ artifact::capture_and_destroy()        │
//!                       │         v                                        │
//!                       │  object_store.rs  (LocalObjectStore, S3ObjectStore) │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                            |
//! |---------------|------------------------------------------------------------|
//! | `models`      | Shared types: `Build`, `Feature`, `Event`, `BusItem`        |
//! | `db`          | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `bus`         | `EventBus` — per-build ring buffer + subscriber fan-out     |
//! | `sse`         | `stream_handler` — backlog replay then live tail over SSE   |
//! | `persistence` | `PersistenceBuffer` — batches events/logs to SQLite          |
//! | `context`     | `BuildContext`, `ControlHandle` — pause/cancel plumbing      |
//! | `gates`       | `GateController` — design/feature review checkpoints         |
//! | `manifest`    | `FeatureManifest`, `ManifestWriter` — serialized mutation     |
//! | `planner`     | Complexity-tier estimation + initial manifest planning       |
//!
//! ## Typical Request Flow (create a build)
//!
//! 1. `POST /builds` → `api::create_build` → `Orchestrator::start_build()`
//! 2. A `BuildHandle` (event bus, gate controller, control signal) is
//!    registered and a driver task is spawned
//! 3. The driver provisions a sandbox, runs Planning then Sequential then
//!    Parallel phases via `executor.rs`, checkpointing against
//!    `ControlHandle` between each for pause/cancel
//! 4. Each `Event`/`LogEntry` is published to the bus and buffered to
//!    `persistence.rs`; `GET /builds/:id/stream` replays the backlog then
//!    tails the live bus
//! 5. On completion `artifact::capture_and_destroy()` zips the sandbox
//!    workspace into object storage and the build transitions to its
//!    terminal status

pub mod api;
pub mod artifact;
pub mod bus;
pub mod config;
pub mod context;
pub mod db;
pub mod executor;
pub mod gates;
pub mod llm;
pub mod manifest;
pub mod models;
pub mod object_store;
pub mod orchestrator;
pub mod persistence;
pub mod planner;
pub mod sandbox;
pub mod server;
pub mod sse;
pub mod stream;
pub mod tool_bridge;
