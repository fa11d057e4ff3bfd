//! Per-build shared handles threaded through the Planning, Sequential, and
//! Parallel phases. Bundles exactly what each phase needs to talk to the
//! sandbox, publish/persist events, and coordinate review gates.
//!
//! Grounded in the teacher's `api::AppState` — one small struct of `Arc`
//! handles passed by reference into handler/phase functions instead of
//! threading each field individually.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use super::bus::EventBus;
use super::db::DbHandle;
use super::gates::GateController;
use super::models::{Build, Event, EventBody, LogEntry, LogLevel};
use super::persistence::PersistenceBuffer;
use super::sandbox::SandboxAdapter;

/// Cooperative pause/cancel signal, set by `factory::orchestrator` and
/// polled by the Planning/Sequential/Parallel phases (spec §4.1: "each
/// operation checks a cooperative shouldStop predicate after every tool
/// execution").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Running,
    Paused,
    Cancelled,
}

/// Grounded in `persistence::PersistenceBuffer`'s `watch::Sender<bool>`
/// shutdown switch, generalized to a three-state signal so pause can be
/// undone (resume) without tearing anything down.
pub struct ControlHandle {
    tx: tokio::sync::watch::Sender<ControlSignal>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _rx) = tokio::sync::watch::channel(ControlSignal::Running);
        Self { tx }
    }

    pub fn request_pause(&self) {
        let _ = self.tx.send(ControlSignal::Paused);
    }

    pub fn request_resume(&self) {
        let _ = self.tx.send(ControlSignal::Running);
    }

    pub fn request_cancel(&self) {
        let _ = self.tx.send(ControlSignal::Cancelled);
    }

    pub fn current(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    /// Block while paused; return `true` once cancellation has been
    /// requested (including while already blocked on a pause). Each
    /// caller subscribes its own receiver so concurrent callers (the
    /// Parallel Executor's subagents) never contend on one handle.
    pub async fn checkpoint(&self) -> bool {
        let mut rx = self.tx.subscribe();
        loop {
            match *rx.borrow() {
                ControlSignal::Cancelled => return true,
                ControlSignal::Running => return false,
                ControlSignal::Paused => {}
            }
            if rx.changed().await.is_err() {
                return true;
            }
        }
    }
}

/// Everything one build's phases need besides the feature manifest itself
/// (which is owned separately by a `ManifestWriter`, per the §9 redesign
/// flag).
pub struct BuildContext {
    pub build_id: Uuid,
    pub sandbox: Arc<dyn SandboxAdapter>,
    pub bus: Arc<EventBus>,
    pub persistence: Arc<PersistenceBuffer>,
    pub gates: Arc<GateController>,
    pub control: Arc<ControlHandle>,
    pub db: DbHandle,
    pub review_gates_enabled: bool,
    /// Local scratch directory the `claude` CLI subprocess is spawned
    /// from. Tool calls it emits are never executed locally; they are
    /// dispatched into `sandbox` by the Tool Bridge.
    pub local_dir: PathBuf,
}

impl BuildContext {
    /// Publish an event to both the live bus and the persistence buffer,
    /// mirroring how every other event-producing call site in this crate
    /// must touch both (spec §4.2/§4.3 run side by side off one publish).
    pub async fn emit(&self, body: EventBody) {
        let event = Event::new(self.build_id, body);
        self.bus.publish(super::models::BusItem::Event(event.clone()));
        self.persistence.push_event(event).await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(self.build_id, level, message);
        self.bus.publish(super::models::BusItem::Log(entry.clone()));
        self.persistence.push_log(entry).await;
    }

    pub async fn set_progress(&self, completed: u32, total: u32) -> anyhow::Result<()> {
        self.db.update_build_progress(self.build_id, completed, total).await?;
        self.emit(EventBody::Progress { completed, total }).await;
        Ok(())
    }

    /// Write the new status to the durable store. For a terminal status,
    /// also publish a `BusItem::Terminal` close signal on the live bus so
    /// any SSE connection already streaming this build sends its own
    /// `complete` envelope without waiting on a poll (spec §4.9).
    pub async fn transition(&self, status: super::models::BuildStatus) -> anyhow::Result<()> {
        self.db.update_build_status(self.build_id, status).await?;
        if status.is_terminal() {
            self.bus
                .publish(super::models::BusItem::terminal(self.build_id, status));
        }
        Ok(())
    }

    /// Cooperative stop checkpoint: blocks while paused, returns `true`
    /// once cancellation has been requested. Call after every tool-call
    /// batch in the Planning/Sequential/Parallel phases.
    pub async fn checkpoint(&self) -> bool {
        self.control.checkpoint().await
    }

    pub async fn load_build(&self) -> anyhow::Result<Build> {
        self.db
            .get_build(self.build_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("build {} disappeared from the store", self.build_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_passes_through_while_running() {
        let control = ControlHandle::new();
        assert!(!control.checkpoint().await);
    }

    #[tokio::test]
    async fn checkpoint_blocks_until_resumed() {
        let control = Arc::new(ControlHandle::new());
        control.request_pause();
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        control.request_resume();
        let cancelled = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("checkpoint should resume")
            .unwrap();
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn checkpoint_reports_cancellation_even_while_paused() {
        let control = Arc::new(ControlHandle::new());
        control.request_pause();
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        control.request_cancel();
        let cancelled = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("checkpoint should observe cancellation")
            .unwrap();
        assert!(cancelled);
    }

    #[test]
    fn current_reflects_last_request() {
        let control = ControlHandle::new();
        assert_eq!(control.current(), ControlSignal::Running);
        control.request_pause();
        assert_eq!(control.current(), ControlSignal::Paused);
        control.request_cancel();
        assert_eq!(control.current(), ControlSignal::Cancelled);
    }
}
