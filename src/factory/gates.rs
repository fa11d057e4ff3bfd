//! Review-gate pause/resume coordination (spec §4.1/§4.5, §8 idempotence
//! law: "Approve is idempotent: a second approve for the same gate is a
//! no-op returning the current state").
//!
//! Grounded in the `tokio::sync::watch` wake-a-waiting-task idiom already
//! used for the Persistence Buffer's shutdown signal
//! (`persistence::PersistenceBuffer`); here a `Notify` is enough since no
//! payload needs to cross the wakeup, only "resume".

use std::sync::Mutex;

use tokio::sync::Notify;

use super::models::Gate;

/// One build's outstanding review-gate state. Owned by `BuildState`
/// alongside its `EventBus` and `PersistenceBuffer`.
#[derive(Default)]
pub struct GateController {
    pending: Mutex<Option<Gate>>,
    notify: Notify,
}

impl GateController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `gate` is awaiting approval, then block the calling
    /// build task until `approve(gate)` is called from the HTTP layer.
    pub async fn wait_for_approval(&self, gate: Gate) {
        *self.pending.lock().expect("gate mutex poisoned") = Some(gate);
        self.notify.notified().await;
    }

    /// Approve `gate`. Returns `true` if this call actually resumed a
    /// waiting build task; returns `false` (no-op) if no matching gate is
    /// pending, satisfying the idempotence law for a repeated approve.
    pub fn approve(&self, gate: Gate) -> bool {
        let mut guard = self.pending.lock().expect("gate mutex poisoned");
        if *guard == Some(gate) {
            *guard = None;
            drop(guard);
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    pub fn pending_gate(&self) -> Option<Gate> {
        *self.pending.lock().expect("gate mutex poisoned")
    }
}
