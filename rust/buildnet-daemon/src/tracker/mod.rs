//! Activity tracker
//!
//! Accumulates incremental changes and fans dashboard state out to
//! subscribers on a broadcast interval. Full snapshots supersede pending
//! increments; the event ring is bounded.

use buildnet_config::TrackerSection;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::clock::Clock;

/// One tracked event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub id: Uuid,
    pub event_type: String,
    pub severity: String,
    pub actor_type: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Subscription filters; `None` means unrestricted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFilters {
    pub event_types: Option<BTreeSet<String>>,
    pub severities: Option<BTreeSet<String>>,
    pub actor_types: Option<BTreeSet<String>>,
}

impl UpdateFilters {
    fn passes(&self, event: &TrackedEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.contains(&event.severity) {
                return false;
            }
        }
        if let Some(actor_types) = &self.actor_types {
            match &event.actor_type {
                Some(actor_type) if actor_types.contains(actor_type) => {}
                _ => return false,
            }
        }
        true
    }
}

/// What subscribers receive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StateUpdate {
    /// Complete dashboard state
    Full { state: Value },
    /// Changes since the last broadcast
    Incremental {
        events: Vec<TrackedEvent>,
        sessions: Vec<Value>,
        builds: Vec<Value>,
        resources: Vec<Value>,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Default)]
struct Pending {
    events: Vec<TrackedEvent>,
    sessions: Vec<Value>,
    builds: Vec<Value>,
    resources: Vec<Value>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.sessions.is_empty()
            && self.builds.is_empty()
            && self.resources.is_empty()
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<StateUpdate>,
    filters: UpdateFilters,
}

/// A live tracker subscription
pub struct TrackerSubscription {
    pub id: String,
    pub rx: mpsc::UnboundedReceiver<StateUpdate>,
}

/// Throttled dashboard fan-out
pub struct ActivityTracker {
    subscribers: DashMap<String, Subscriber>,
    pending: parking_lot::Mutex<Pending>,
    recent: parking_lot::Mutex<VecDeque<TrackedEvent>>,
    full_state: parking_lot::RwLock<Value>,
    config: TrackerSection,
}

impl ActivityTracker {
    pub fn new(config: TrackerSection) -> Self {
        Self {
            subscribers: DashMap::new(),
            pending: parking_lot::Mutex::new(Pending::default()),
            recent: parking_lot::Mutex::new(VecDeque::new()),
            full_state: parking_lot::RwLock::new(Value::Null),
            config,
        }
    }

    /// Subscribe; the current full state is delivered immediately
    pub fn subscribe(&self, id: &str, filters: UpdateFilters) -> TrackerSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.full_state.read().clone();
        let _ = tx.send(StateUpdate::Full { state });
        self.subscribers
            .insert(id.to_string(), Subscriber { tx, filters });
        TrackerSubscription {
            id: id.to_string(),
            rx,
        }
    }

    /// Drop a subscription
    pub fn unsubscribe(&self, id: &str) {
        self.subscribers.remove(id);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Refresh the stored snapshot without broadcasting
    pub fn set_full_state(&self, state: Value) {
        *self.full_state.write() = state;
    }

    /// Publish a full snapshot now; supersedes pending increments
    pub fn update_state(&self, state: Value) {
        self.set_full_state(state.clone());
        *self.pending.lock() = Pending::default();
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry
                .value()
                .tx
                .send(StateUpdate::Full {
                    state: state.clone(),
                })
                .is_err()
            {
                dead.push(entry.key().clone());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    /// Record one event into the pending batch and the bounded ring
    pub fn record_event(
        &self,
        event_type: &str,
        severity: &str,
        actor_type: Option<&str>,
        payload: Value,
    ) {
        let event = TrackedEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            severity: severity.to_string(),
            actor_type: actor_type.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        };
        self.pending.lock().events.push(event.clone());
        let mut recent = self.recent.lock();
        recent.push_back(event);
        while recent.len() > self.config.recent_events_limit {
            recent.pop_front();
        }
    }

    /// Queue a session change for the next broadcast
    pub fn record_session_change(&self, change: Value) {
        self.pending.lock().sessions.push(change);
    }

    /// Queue a build change for the next broadcast
    pub fn record_build_change(&self, change: Value) {
        self.pending.lock().builds.push(change);
    }

    /// Queue a resource change for the next broadcast
    pub fn record_resource_change(&self, change: Value) {
        self.pending.lock().resources.push(change);
    }

    /// Latest events from the ring, newest last
    pub fn get_recent_events(&self, limit: usize) -> Vec<TrackedEvent> {
        let recent = self.recent.lock();
        recent
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// One broadcast tick: flush the accumulator if anything is pending
    pub fn flush_once(&self) {
        let pending = {
            let mut guard = self.pending.lock();
            if guard.is_empty() {
                return;
            }
            std::mem::take(&mut *guard)
        };
        let timestamp = Utc::now();
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            let events: Vec<TrackedEvent> = pending
                .events
                .iter()
                .filter(|e| subscriber.filters.passes(e))
                .cloned()
                .collect();
            if events.is_empty()
                && pending.sessions.is_empty()
                && pending.builds.is_empty()
                && pending.resources.is_empty()
            {
                continue;
            }
            let update = StateUpdate::Incremental {
                events,
                sessions: pending.sessions.clone(),
                builds: pending.builds.clone(),
                resources: pending.resources.clone(),
                timestamp,
            };
            if subscriber.tx.send(update).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    /// Periodic flush loop, one incremental per interval at most
    pub async fn run_flush_loop(self: Arc<Self>, clock: Arc<dyn Clock>) {
        let interval = std::time::Duration::from_millis(self.config.broadcast_interval_ms);
        loop {
            clock.sleep(interval).await;
            self.flush_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> ActivityTracker {
        ActivityTracker::new(TrackerSection {
            broadcast_interval_ms: 100,
            recent_events_limit: 3,
        })
    }

    #[tokio::test]
    async fn subscription_receives_full_state_then_increments() {
        let tracker = tracker();
        tracker.set_full_state(json!({"builds": []}));
        let mut sub = tracker.subscribe("dash-1", UpdateFilters::default());

        let Some(StateUpdate::Full { state }) = sub.rx.recv().await else {
            panic!("expected full state first");
        };
        assert_eq!(state, json!({"builds": []}));

        tracker.record_event("build:completed", "info", Some("system"), json!({}));
        tracker.record_build_change(json!({"build_id": "b1"}));
        tracker.flush_once();

        let Some(StateUpdate::Incremental { events, builds, .. }) = sub.rx.recv().await else {
            panic!("expected incremental");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(builds.len(), 1);
    }

    #[tokio::test]
    async fn empty_accumulator_does_not_broadcast() {
        let tracker = tracker();
        let mut sub = tracker.subscribe("dash-1", UpdateFilters::default());
        let _ = sub.rx.recv().await; // initial full state
        tracker.flush_once();
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_update_supersedes_pending_increments() {
        let tracker = tracker();
        let mut sub = tracker.subscribe("dash-1", UpdateFilters::default());
        let _ = sub.rx.recv().await;

        tracker.record_event("noise", "info", None, json!({}));
        tracker.update_state(json!({"fresh": true}));
        tracker.flush_once();

        let Some(StateUpdate::Full { state }) = sub.rx.recv().await else {
            panic!("expected full state");
        };
        assert_eq!(state, json!({"fresh": true}));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_filters_restrict_delivery() {
        let tracker = tracker();
        let mut sub = tracker.subscribe(
            "dash-1",
            UpdateFilters {
                event_types: Some(["build:completed".to_string()].into_iter().collect()),
                ..Default::default()
            },
        );
        let _ = sub.rx.recv().await;

        tracker.record_event("session:created", "info", None, json!({}));
        tracker.flush_once();
        assert!(sub.rx.try_recv().is_err());

        tracker.record_event("build:completed", "info", None, json!({}));
        tracker.flush_once();
        let Some(StateUpdate::Incremental { events, .. }) = sub.rx.recv().await else {
            panic!("expected incremental");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "build:completed");
    }

    #[test]
    fn event_ring_is_bounded() {
        let tracker = tracker();
        for i in 0..5 {
            tracker.record_event(&format!("e{}", i), "info", None, json!({}));
        }
        let events = tracker.get_recent_events(10);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "e2");
        assert_eq!(events[2].event_type, "e4");
    }
}
