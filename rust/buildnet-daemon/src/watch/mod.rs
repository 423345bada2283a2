//! File watcher
//!
//! Raw filesystem events (from notify, or injected directly) are debounced
//! into batches, classified by impact, and published on the bus as
//! `file:changed` / `changes:batched` / `preparation:ready`.

pub mod classify;

pub use classify::{classify_batch, glob_match, is_cosmetic, package_of, path_included};

use crate::clock::Clock;
use crate::error::{DaemonError, DaemonResult};
use crate::events::EventBus;
use buildnet_config::WatchSection;
use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Added,
    Modified,
    Deleted,
}

/// One raw filesystem event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: String,
    pub kind: FileEventKind,
    pub timestamp: DateTime<Utc>,
}

/// Four-level classification of a batch, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeImpact {
    Ignored,
    Cosmetic,
    Local,
    Broad,
}

/// A closed debounce batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub events: Vec<FileEvent>,
    pub impact: ChangeImpact,
    pub packages: Vec<String>,
    pub closed_at: DateTime<Utc>,
}

struct WatcherState {
    notify: Option<notify::RecommendedWatcher>,
    task: Option<tokio::task::JoinHandle<()>>,
    ingest_rx: Option<mpsc::UnboundedReceiver<FileEvent>>,
}

/// Debouncing file watcher
pub struct FileWatcher {
    config: WatchSection,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ingest_tx: mpsc::UnboundedSender<FileEvent>,
    state: parking_lot::Mutex<WatcherState>,
}

impl FileWatcher {
    pub fn new(config: WatchSection, bus: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        Self {
            config,
            bus,
            clock,
            ingest_tx,
            state: parking_lot::Mutex::new(WatcherState {
                notify: None,
                task: None,
                ingest_rx: Some(ingest_rx),
            }),
        }
    }

    /// Feed one raw event into the debouncer
    ///
    /// The notify callback uses this; tests inject events directly.
    pub fn ingest(&self, event: FileEvent) {
        let _ = self.ingest_tx.send(event);
    }

    /// Start the debounce task and, when roots exist, the OS watcher
    pub fn start(&self) -> DaemonResult<()> {
        let mut state = self.state.lock();
        let rx = state
            .ingest_rx
            .take()
            .ok_or_else(|| DaemonError::Watch("watcher already started".to_string()))?;

        let bus = self.bus.clone();
        let clock = self.clock.clone();
        let config = self.config.clone();
        state.task = Some(tokio::spawn(async move {
            debounce_loop(rx, bus, clock, config).await;
        }));

        if self.config.enabled {
            let tx = self.ingest_tx.clone();
            let mut watcher = notify::RecommendedWatcher::new(
                move |result: notify::Result<notify::Event>| {
                    let Ok(event) = result else { return };
                    let kind = match event.kind {
                        notify::EventKind::Create(_) => FileEventKind::Added,
                        notify::EventKind::Modify(_) => FileEventKind::Modified,
                        notify::EventKind::Remove(_) => FileEventKind::Deleted,
                        _ => return,
                    };
                    for path in event.paths {
                        let _ = tx.send(FileEvent {
                            path: path.to_string_lossy().into_owned(),
                            kind,
                            timestamp: Utc::now(),
                        });
                    }
                },
                notify::Config::default(),
            )
            .map_err(|e| DaemonError::Watch(e.to_string()))?;

            for root in &self.config.paths {
                let root = Path::new(root);
                if root.exists() {
                    watcher
                        .watch(root, RecursiveMode::Recursive)
                        .map_err(|e| DaemonError::Watch(e.to_string()))?;
                }
            }
            state.notify = Some(watcher);
            info!(roots = self.config.paths.len(), "File watcher started");
        }
        Ok(())
    }

    /// Stop watching and drop the debounce task
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.notify = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<FileEvent>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: WatchSection,
) {
    let debounce = Duration::from_millis(config.debounce_ms);
    while let Some(first) = rx.recv().await {
        let mut events = vec![first];
        loop {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(event) => events.push(event),
                    None => break,
                },
                _ = clock.sleep(debounce) => break,
            }
        }
        close_batch(&bus, &clock, &config, events);
    }
}

fn close_batch(
    bus: &EventBus,
    clock: &Arc<dyn Clock>,
    config: &WatchSection,
    events: Vec<FileEvent>,
) {
    for event in &events {
        if let Ok(payload) = serde_json::to_value(event) {
            bus.emit("file:changed", payload);
        }
    }

    let (impact, packages) = classify_batch(&events, config);
    let batch = ChangeBatch {
        events,
        impact,
        packages: packages.clone(),
        closed_at: clock.now(),
    };
    debug!(
        events = batch.events.len(),
        impact = ?batch.impact,
        "Change batch closed"
    );
    if let Ok(payload) = serde_json::to_value(&batch) {
        bus.emit("changes:batched", payload);
    }
    if config.preemptive_prepare && impact >= ChangeImpact::Local {
        bus.emit(
            "preparation:ready",
            serde_json::json!({"packages": packages}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn quick_config() -> WatchSection {
        WatchSection {
            debounce_ms: 40,
            ..Default::default()
        }
    }

    fn event(path: &str) -> FileEvent {
        FileEvent {
            path: path.to_string(),
            kind: FileEventKind::Modified,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn rapid_events_coalesce_into_one_batch() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Some("changes:batched"));
        let watcher = FileWatcher::new(
            WatchSection {
                enabled: false,
                ..quick_config()
            },
            bus.clone(),
            Arc::new(SystemClock),
        );
        watcher.start().unwrap();

        watcher.ingest(event("packages/core/a.ts"));
        watcher.ingest(event("packages/core/b.ts"));
        watcher.ingest(event("packages/ui/x.ts"));
        watcher.ingest(event("packages/core/c.ts"));

        let batched = sub.rx.recv().await.unwrap();
        let batch: ChangeBatch = serde_json::from_value(batched.payload).unwrap();
        assert_eq!(batch.events.len(), 4);
        assert_eq!(batch.impact, ChangeImpact::Broad);
        assert_eq!(batch.packages, vec!["core".to_string(), "ui".to_string()]);

        // No second batch follows
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sub.rx.try_recv().is_err());
        watcher.stop();
    }

    #[tokio::test]
    async fn separated_events_produce_separate_batches() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Some("changes:batched"));
        let watcher = FileWatcher::new(
            WatchSection {
                enabled: false,
                ..quick_config()
            },
            bus.clone(),
            Arc::new(SystemClock),
        );
        watcher.start().unwrap();

        watcher.ingest(event("packages/core/a.ts"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        watcher.ingest(event("packages/ui/x.ts"));

        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        let first: ChangeBatch = serde_json::from_value(first.payload).unwrap();
        let second: ChangeBatch = serde_json::from_value(second.payload).unwrap();
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.impact, ChangeImpact::Local);
        assert_eq!(second.events.len(), 1);
        watcher.stop();
    }

    #[tokio::test]
    async fn preparation_ready_fires_for_local_and_above() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Some("preparation:ready"));
        let watcher = FileWatcher::new(
            WatchSection {
                enabled: false,
                preemptive_prepare: true,
                ..quick_config()
            },
            bus.clone(),
            Arc::new(SystemClock),
        );
        watcher.start().unwrap();

        watcher.ingest(event("packages/core/a.ts"));
        let prep = sub.rx.recv().await.unwrap();
        assert_eq!(prep.payload["packages"], serde_json::json!(["core"]));
        watcher.stop();
    }
}
