//! Batches event/log writes to the durable store with retry (spec §4.3).
//!
//! Grounded in the teacher's batched-DB-writer task in
//! `agent_executor::run_task` (an mpsc channel feeding a dedicated task
//! that drains up to a fixed batch size) and the `tokio::select!`
//! ping/forward loop in `factory::ws::run_socket_loop`, here driving a
//! size-or-timer flush instead of a ping timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::db::DbHandle;
use super::models::{Event, LogEntry};

const FLUSH_SIZE: usize = 10;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

struct Buffers {
    events: Vec<Event>,
    logs: Vec<LogEntry>,
}

/// Owns the two per-build buffers and the flusher task's shutdown switch.
pub struct PersistenceBuffer {
    buffers: Arc<Mutex<Buffers>>,
    db: DbHandle,
    build_id: uuid::Uuid,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl PersistenceBuffer {
    /// Spawn the buffer and its periodic flusher task for `build_id`.
    pub fn spawn(db: DbHandle, build_id: uuid::Uuid) -> Self {
        let buffers = Arc::new(Mutex::new(Buffers {
            events: Vec::new(),
            logs: Vec::new(),
        }));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let flusher_buffers = Arc::clone(&buffers);
        let flusher_db = db.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flush_once(&flusher_buffers, &flusher_db, build_id).await;
                    }
                    _ = shutdown_rx.changed() => {
                        flush_once(&flusher_buffers, &flusher_db, build_id).await;
                        break;
                    }
                }
            }
        });

        Self {
            buffers,
            db,
            build_id,
            shutdown_tx,
        }
    }

    /// Buffer an event, flushing immediately once the size threshold is
    /// reached (whichever comes first of size >= 10 or the 500ms timer,
    /// per spec §4.3).
    pub async fn push_event(&self, event: Event) {
        let should_flush = {
            let mut guard = self.buffers.lock().await;
            guard.events.push(event);
            guard.events.len() >= FLUSH_SIZE
        };
        if should_flush {
            flush_once(&self.buffers, &self.db, self.build_id).await;
        }
    }

    pub async fn push_log(&self, log: LogEntry) {
        let should_flush = {
            let mut guard = self.buffers.lock().await;
            guard.logs.push(log);
            guard.logs.len() >= FLUSH_SIZE
        };
        if should_flush {
            flush_once(&self.buffers, &self.db, self.build_id).await;
        }
    }

    pub async fn pending_event_count(&self) -> usize {
        self.buffers.lock().await.events.len()
    }

    pub async fn pending_log_count(&self) -> usize {
        self.buffers.lock().await.logs.len()
    }

    /// Perform one synchronous flush now, used by callers that want an
    /// immediate drain (size-triggered flush) without waiting for the
    /// timer.
    pub async fn flush_now(&self, db: &DbHandle, build_id: uuid::Uuid) {
        flush_once(&self.buffers, db, build_id).await;
    }

    /// Final synchronous flush on build termination, per spec §4.3.
    pub async fn shutdown(&self, db: &DbHandle, build_id: uuid::Uuid) {
        let _ = self.shutdown_tx.send(true);
        flush_once(&self.buffers, db, build_id).await;
    }
}

async fn flush_once(buffers: &Arc<Mutex<Buffers>>, db: &DbHandle, build_id: uuid::Uuid) {
    let (events, logs) = {
        let mut guard = buffers.lock().await;
        (
            std::mem::take(&mut guard.events),
            std::mem::take(&mut guard.logs),
        )
    };

    if !events.is_empty() {
        if let Err(err) = db.create_build_events_batch(build_id, events.clone()).await {
            tracing::warn!(error = %err, count = events.len(), "event batch flush failed, re-queueing");
            let mut guard = buffers.lock().await;
            let mut restored = events;
            restored.append(&mut guard.events);
            guard.events = restored;
        }
    }

    if !logs.is_empty() {
        if let Err(err) = db.create_build_logs_batch(build_id, logs.clone()).await {
            tracing::warn!(error = %err, count = logs.len(), "log batch flush failed, re-queueing");
            let mut guard = buffers.lock().await;
            let mut restored = logs;
            restored.append(&mut guard.logs);
            guard.logs = restored;
        }
    }
}
