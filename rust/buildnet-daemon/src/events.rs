//! In-process event bus
//!
//! Explicit subscriber registry with unsubscribe handles. Emitters enqueue
//! and return immediately; a drain task fans events out to subscribers
//! sequentially, preserving emission order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One event on the bus
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    /// Topic, e.g. `changes:batched` or `resource:forced_removal`
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

struct Subscriber {
    topic_prefix: Option<String>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// A live subscription; dropping the receiver ends delivery
pub struct BusSubscription {
    pub id: Uuid,
    pub rx: mpsc::UnboundedReceiver<BusEvent>,
}

/// Queue-and-drain event bus
pub struct EventBus {
    subscribers: DashMap<Uuid, Subscriber>,
    queue: mpsc::UnboundedSender<BusEvent>,
}

impl EventBus {
    /// Create the bus and spawn its drain task
    pub fn new() -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<BusEvent>();
        let bus = Arc::new(Self {
            subscribers: DashMap::new(),
            queue,
        });
        let drain = Arc::downgrade(&bus);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(bus) = drain.upgrade() else { break };
                bus.dispatch(event);
            }
        });
        bus
    }

    fn dispatch(&self, event: BusEvent) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if let Some(prefix) = &subscriber.topic_prefix {
                if !event.topic.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if subscriber.tx.send(event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    /// Emit an event; never blocks the caller
    pub fn emit(&self, topic: &str, payload: Value) {
        let event = BusEvent {
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        // Send only fails when the drain task is gone, i.e. at shutdown
        let _ = self.queue.send(event);
    }

    /// Subscribe, optionally restricted to topics with the given prefix
    pub fn subscribe(&self, topic_prefix: Option<&str>) -> BusSubscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(
            id,
            Subscriber {
                topic_prefix: topic_prefix.map(str::to_string),
                tx,
            },
        );
        BusSubscription { id, rx }
    }

    /// Drop a subscription by id
    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.remove(&id);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_reach_subscribers_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None);
        bus.emit("build:started", json!({"id": "b1"}));
        bus.emit("build:completed", json!({"id": "b1"}));

        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        assert_eq!(first.topic, "build:started");
        assert_eq!(second.topic, "build:completed");
    }

    #[tokio::test]
    async fn prefix_filter_restricts_topics() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Some("resource:"));
        bus.emit("session:created", json!({}));
        bus.emit("resource:added", json!({"id": "w1"}));

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.topic, "resource:added");
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
