//! SSE Streamer: binds one HTTP client to a build's Event Bus plus its
//! durable backlog (spec §4.9).
//!
//! Grounded in `bus::EventBus`'s mpsc-channel-per-subscriber shape: the
//! streamer itself is just another subscriber, and the historical/polling
//! paths reuse the bus's `sent_ids`-dedup idiom against a local set since
//! they read straight from the durable store instead of the bus.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::bus::EventBus;
use super::config::{SSE_HEARTBEAT_SECS, SSE_POLL_INTERVAL_SECS};
use super::db::DbHandle;
use super::models::{Build, BuildStatus, BusItem, Event, LogEntry};

/// Looks up whether a build has a live, in-memory `EventBus` on this
/// node. Implemented by `factory::orchestrator::BuildRegistry`; kept as a
/// trait here so the streamer doesn't need to know about the rest of the
/// orchestrator's build-lifecycle machinery.
#[async_trait]
pub trait ActiveBuildRegistry: Send + Sync {
    fn active_bus(&self, build_id: Uuid) -> Option<Arc<EventBus>>;
}

#[derive(Clone)]
pub struct SseState<R: ActiveBuildRegistry> {
    pub db: DbHandle,
    pub registry: Arc<R>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Complete,
    Active,
    RunningElsewhere,
}

fn classify(build: &Build, bus: Option<&Arc<EventBus>>) -> Classification {
    if build.status.is_terminal() {
        Classification::Complete
    } else if bus.is_some() {
        Classification::Active
    } else {
        Classification::RunningElsewhere
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    Connected {
        build_status: BuildStatus,
        is_live: bool,
        started_at: Option<DateTime<Utc>>,
    },
    Heartbeat,
    Event {
        #[serde(flatten)]
        event: Event,
        historical: bool,
    },
    Log {
        #[serde(flatten)]
        log: LogEntry,
        historical: bool,
    },
    Complete {
        build_status: BuildStatus,
    },
}

/// `None` for a `Terminal` item: callers handle that one specially
/// instead of forwarding it as a data envelope.
fn envelope_for_item(item: BusItem, historical: bool) -> Option<Envelope> {
    match item {
        BusItem::Event(event) => Some(Envelope::Event { event, historical }),
        BusItem::Log(log) => Some(Envelope::Log { log, historical }),
        BusItem::Terminal { .. } => None,
    }
}

fn to_sse(envelope: &Envelope) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default().json_data(envelope).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to serialize sse envelope");
        SseEvent::default().data("{}")
    }))
}

async fn load_sorted_history(db: &DbHandle, build_id: Uuid) -> anyhow::Result<Vec<BusItem>> {
    let events = db.list_build_events(build_id).await?;
    let logs = db.list_build_logs(build_id).await?;

    let mut items: Vec<BusItem> = events
        .into_iter()
        .map(BusItem::Event)
        .chain(logs.into_iter().map(BusItem::Log))
        .collect();
    items.sort_by_key(|item| (item.timestamp(), item.id()));
    Ok(items)
}

/// Drive one SSE connection to completion, sending envelopes into `tx`
/// until the stream closes (client disconnect, or a terminal `complete`
/// envelope).
async fn run_connection(
    db: DbHandle,
    bus: Option<Arc<EventBus>>,
    build: Build,
    tx: tokio::sync::mpsc::Sender<Result<SseEvent, Infallible>>,
) {
    let classification = classify(&build, bus.as_ref());
    let is_live = matches!(classification, Classification::Active);

    let connected = Envelope::Connected {
        build_status: build.status,
        is_live,
        started_at: build.started_at,
    };
    if tx.send(to_sse(&connected)).await.is_err() {
        return;
    }

    let mut sent_ids: HashSet<Uuid> = HashSet::new();

    if matches!(
        classification,
        Classification::Complete | Classification::RunningElsewhere
    ) {
        let history = match load_sorted_history(&db, build.id).await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error = %err, build_id = %build.id, "failed to load sse history");
                Vec::new()
            }
        };
        for item in history {
            sent_ids.insert(item.id());
            if let Some(envelope) = envelope_for_item(item, true) {
                if tx.send(to_sse(&envelope)).await.is_err() {
                    return;
                }
            }
        }
    }

    match classification {
        Classification::Complete => {
            let complete = Envelope::Complete {
                build_status: build.status,
            };
            let _ = tx.send(to_sse(&complete)).await;
        }
        Classification::Active => {
            run_live(&bus.expect("active classification implies a bus"), &tx).await;
        }
        Classification::RunningElsewhere => {
            run_polling(&db, build.id, sent_ids, &tx).await;
        }
    }
}

/// Live path: subscribe to the in-memory bus and forward everything,
/// racing a heartbeat timer so idle connections still see traffic.
async fn run_live(bus: &Arc<EventBus>, tx: &tokio::sync::mpsc::Sender<Result<SseEvent, Infallible>>) {
    let mut subscription = bus.subscribe();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(SSE_HEARTBEAT_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            item = subscription.rx.recv() => {
                match item {
                    Some(BusItem::Terminal { status, .. }) => {
                        let complete = Envelope::Complete { build_status: status };
                        let _ = tx.send(to_sse(&complete)).await;
                        break;
                    }
                    Some(item) => {
                        if let Some(envelope) = envelope_for_item(item, false) {
                            if tx.send(to_sse(&envelope)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if tx.send(to_sse(&Envelope::Heartbeat)).await.is_err() {
                    break;
                }
            }
        }
    }

    bus.unsubscribe(subscription.id);
}

/// `running-elsewhere` path: no local bus, so poll the durable store on
/// an interval and dedup against `sent_ids`, stopping once the build's
/// status turns terminal.
async fn run_polling(
    db: &DbHandle,
    build_id: Uuid,
    mut sent_ids: HashSet<Uuid>,
    tx: &tokio::sync::mpsc::Sender<Result<SseEvent, Infallible>>,
) {
    let mut poll = tokio::time::interval(Duration::from_secs(SSE_POLL_INTERVAL_SECS));
    loop {
        poll.tick().await;

        let build = match db.get_build(build_id).await {
            Ok(Some(build)) => build,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, %build_id, "sse poll failed to load build");
                continue;
            }
        };

        let history = match load_sorted_history(db, build_id).await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error = %err, %build_id, "sse poll failed to load history");
                continue;
            }
        };
        for item in history {
            if sent_ids.insert(item.id()) {
                if let Some(envelope) = envelope_for_item(item, true) {
                    if tx.send(to_sse(&envelope)).await.is_err() {
                        return;
                    }
                }
            }
        }

        if build.status.is_terminal() {
            let complete = Envelope::Complete {
                build_status: build.status,
            };
            let _ = tx.send(to_sse(&complete)).await;
            break;
        }
    }
}

pub async fn stream_handler<R: ActiveBuildRegistry + 'static>(
    State(state): State<SseState<R>>,
    Path(build_id): Path<Uuid>,
) -> Result<Sse<ReceiverStream<Result<SseEvent, Infallible>>>, super::api::ApiError> {
    let build = state
        .db
        .get_build(build_id)
        .await
        .map_err(crate::errors::BuildError::Database)?
        .ok_or(crate::errors::BuildError::BuildNotFound { id: build_id })?;

    let bus = state.registry.active_bus(build_id);
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(run_connection(state.db.clone(), bus, build, tx));

    Ok(Sse::new(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::models::{Event, EventBody, LogLevel};

    fn pending_build() -> Build {
        Build::new("owner", "spec")
    }

    #[test]
    fn classify_terminal_build_is_complete() {
        let mut build = pending_build();
        build.status = BuildStatus::Completed;
        assert_eq!(classify(&build, None), Classification::Complete);
    }

    #[test]
    fn classify_running_with_bus_is_active() {
        let mut build = pending_build();
        build.status = BuildStatus::Running;
        let bus = Arc::new(EventBus::default());
        assert_eq!(classify(&build, Some(&bus)), Classification::Active);
    }

    #[test]
    fn classify_running_without_bus_is_running_elsewhere() {
        let mut build = pending_build();
        build.status = BuildStatus::Running;
        assert_eq!(classify(&build, None), Classification::RunningElsewhere);
    }

    #[tokio::test]
    async fn history_is_sorted_by_timestamp_then_id() {
        let db = DbHandle::new_in_memory().unwrap();
        let build = pending_build();
        db.create_build(&build).await.unwrap();

        let e1 = Event::new(build.id, EventBody::Phase { name: "plan".into() });
        let e2 = Event::new(build.id, EventBody::Phase { name: "build".into() });
        db.create_build_events_batch(build.id, vec![e1.clone(), e2.clone()])
            .await
            .unwrap();
        let l1 = LogEntry::new(build.id, LogLevel::Info, "hello");
        db.create_build_logs_batch(build.id, vec![l1.clone()]).await.unwrap();

        let history = load_sorted_history(&db, build.id).await.unwrap();
        assert_eq!(history.len(), 3);
        let mut timestamps: Vec<_> = history.iter().map(|i| i.timestamp()).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
        timestamps.clear();
    }

    #[tokio::test]
    async fn complete_connection_sends_connected_history_and_complete() {
        let db = DbHandle::new_in_memory().unwrap();
        let mut build = pending_build();
        build.status = BuildStatus::Completed;
        db.create_build(&build).await.unwrap();
        let event = Event::new(build.id, EventBody::Phase { name: "plan".into() });
        db.create_build_events_batch(build.id, vec![event]).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        run_connection(db, None, build, tx).await;

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3); // connected + 1 historical + complete
    }
}
