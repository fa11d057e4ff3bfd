//! Per-build in-memory multi-subscriber event/log fan-out (spec §4.2).
//!
//! Replaces the teacher's single global `broadcast::Sender<String>` in
//! `factory::ws` with an explicit subscriber struct per the §9 redesign
//! flag: "model as an explicit subscriber struct holding a bounded
//! channel plus a sent-ids set; the Event Bus owns a slice of subscribers
//! and fans out non-blockingly." `subscribe()` registers the channel
//! before replaying the buffered backlog through it, guaranteeing no gap
//! between replay and live delivery.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use super::models::BusItem;

const DEFAULT_RING_CAPACITY: usize = 2000;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

struct Subscriber {
    id: Uuid,
    tx: tokio::sync::mpsc::Sender<BusItem>,
    sent_ids: HashSet<Uuid>,
}

struct Inner {
    ring: VecDeque<BusItem>,
    ring_capacity: usize,
    subscribers: Vec<Subscriber>,
}

/// A per-build event bus. Single-writer (the build task calls `publish`),
/// many-reader (subscribers poll their own channel).
pub struct EventBus {
    inner: Mutex<Inner>,
}

/// A live registration on the bus; drop to unsubscribe.
pub struct Subscription {
    pub id: Uuid,
    pub rx: tokio::sync::mpsc::Receiver<BusItem>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl EventBus {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(ring_capacity.min(64)),
                ring_capacity,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append an item to the ring and fan it out to every subscriber in
    /// registration order. Never blocks on a slow subscriber: a full
    /// channel drops the item for that subscriber only, per spec §4.2.
    pub fn publish(&self, item: BusItem) {
        let mut guard = self.inner.lock().expect("event bus mutex poisoned");
        if guard.ring.len() >= guard.ring_capacity {
            guard.ring.pop_front();
        }
        guard.ring.push_back(item.clone());

        for subscriber in guard.subscribers.iter_mut() {
            if subscriber.sent_ids.contains(&item.id()) {
                continue;
            }
            match subscriber.tx.try_send(item.clone()) {
                Ok(()) => {
                    subscriber.sent_ids.insert(item.id());
                }
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        subscriber_id = %subscriber.id,
                        "event bus subscriber channel full, dropping item for this subscriber"
                    );
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        guard.subscribers.retain(|s| !s.tx.is_closed());
    }

    /// Register, then replay the current backlog into the new channel
    /// before returning it - callers must consume `rx` to see the replay,
    /// after which live items arrive on the same channel with no gap.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = tokio::sync::mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        let mut sent_ids = HashSet::new();

        let mut guard = self.inner.lock().expect("event bus mutex poisoned");
        for item in guard.ring.iter() {
            if tx.try_send(item.clone()).is_ok() {
                sent_ids.insert(item.id());
            }
        }
        guard.subscribers.push(Subscriber { id, tx, sent_ids });

        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let mut guard = self.inner.lock().expect("event bus mutex poisoned");
        guard.subscribers.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus mutex poisoned").subscribers.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().expect("event bus mutex poisoned").ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::models::{Event, EventBody};
    use uuid::Uuid;

    fn sample_event(build_id: Uuid) -> BusItem {
        BusItem::Event(Event::new(build_id, EventBody::Phase { name: "plan".into() }))
    }

    #[tokio::test]
    async fn subscribe_replays_existing_backlog() {
        let bus = EventBus::default();
        let build_id = Uuid::new_v4();
        bus.publish(sample_event(build_id));
        bus.publish(sample_event(build_id));

        let mut sub = bus.subscribe();
        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn subscribe_then_publish_has_no_gap() {
        let bus = EventBus::default();
        let build_id = Uuid::new_v4();
        let mut sub = bus.subscribe();
        bus.publish(sample_event(build_id));

        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.timestamp().timestamp_millis() > 0, true);
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_item_at_most_once() {
        let bus = EventBus::default();
        let build_id = Uuid::new_v4();
        let item = sample_event(build_id);
        let expected_id = item.id();

        let mut sub = bus.subscribe();
        bus.publish(item);

        let received = sub.rx.recv().await.unwrap();
        assert_eq!(received.id(), expected_id);

        // No duplicate delivery: the channel should not yield it again.
        let second = tokio::time::timeout(std::time::Duration::from_millis(20), sub.rx.recv())
            .await;
        assert!(second.is_err(), "expected no second delivery of the same item");
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let bus = EventBus::default();
        let build_id = Uuid::new_v4();
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(sample_event(build_id));
    }

    #[test]
    fn ring_buffer_caps_at_configured_capacity() {
        let bus = EventBus::new(2);
        let build_id = Uuid::new_v4();
        bus.publish(sample_event(build_id));
        bus.publish(sample_event(build_id));
        bus.publish(sample_event(build_id));
        assert_eq!(bus.backlog_len(), 2);
    }

    #[tokio::test]
    async fn full_subscriber_channel_does_not_block_publisher() {
        let bus = EventBus::new(10);
        let build_id = Uuid::new_v4();
        let _sub = bus.subscribe();
        // Publish more than the subscriber channel capacity without ever
        // draining it; publish() must not block or panic.
        for _ in 0..(super::SUBSCRIBER_CHANNEL_CAPACITY + 5) {
            bus.publish(sample_event(build_id));
        }
    }
}
