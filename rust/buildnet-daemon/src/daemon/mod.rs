//! Master daemon
//!
//! Wires the ledger, registry, session manager, watcher, orchestrator, and
//! tracker over one state backend; owns the periodic tasks and the
//! auto-build trigger.

use crate::clock::{Clock, SystemClock};
use crate::error::{DaemonError, DaemonResult};
use crate::events::EventBus;
use crate::orchestrate::{
    BuildOptions, BuildOrchestrator, BuildRequest, BuildResult, BundleExecutor, SimulatedExecutor,
};
use crate::registry::ResourceRegistry;
use crate::session::SessionManager;
use crate::tracker::ActivityTracker;
use crate::watch::{classify, ChangeBatch, ChangeImpact, FileWatcher};
use buildnet_config::BuildNetConfig;
use buildnet_ledger::{Actor, Ledger, LedgerConfig};
use buildnet_state::{MemoryBackend, StateBackend};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// The top-level daemon value; no process-global instance exists
pub struct MasterDaemon {
    config: BuildNetConfig,
    backend: Arc<dyn StateBackend>,
    ledger: Arc<Ledger>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    registry: Arc<ResourceRegistry>,
    sessions: Arc<SessionManager>,
    watcher: Arc<FileWatcher>,
    orchestrator: Arc<BuildOrchestrator>,
    tracker: Arc<ActivityTracker>,
    /// Concurrent-build limiter; waiters queue FIFO
    build_slots: Arc<Semaphore>,
    started_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MasterDaemon {
    /// Assemble a daemon over the given backend, clock, and executor
    pub async fn new(
        config: BuildNetConfig,
        backend: Arc<dyn StateBackend>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn BundleExecutor>,
    ) -> DaemonResult<Arc<Self>> {
        let mut ledger_config = LedgerConfig::default();
        if !config.audit.mirror_path.is_empty() {
            ledger_config.mirror_path = Some(config.audit.mirror_path.clone().into());
        }
        let ledger = Arc::new(Ledger::open(backend.clone(), ledger_config).await?);
        let bus = EventBus::new();

        let registry = Arc::new(ResourceRegistry::new(
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            config.workers.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            registry.clone(),
            config.sessions.clone(),
        ));
        let watcher = Arc::new(FileWatcher::new(
            config.watch.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let orchestrator = Arc::new(BuildOrchestrator::new(
            ledger.clone(),
            registry.clone(),
            bus.clone(),
            clock.clone(),
            executor,
            config.build.clone(),
            config.workers.clone(),
        ));
        let tracker = Arc::new(ActivityTracker::new(config.tracker.clone()));
        let build_slots = Arc::new(Semaphore::new(config.auto_build.max_concurrent_builds));

        Ok(Arc::new(Self {
            config,
            backend,
            ledger,
            bus,
            clock,
            registry,
            sessions,
            watcher,
            orchestrator,
            tracker,
            build_slots,
            started_at: parking_lot::RwLock::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Memory backend, system clock, simulated executor
    pub async fn with_defaults(config: BuildNetConfig) -> DaemonResult<Arc<Self>> {
        Self::new(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(SystemClock),
            Arc::new(SimulatedExecutor::new()),
        )
        .await
    }

    /// Start periodic tasks, listeners, and the file watcher
    pub async fn start(self: &Arc<Self>) -> DaemonResult<()> {
        *self.started_at.write() = Some(self.clock.now());
        let mut tasks = Vec::new();

        // Heartbeat health scanner
        {
            let registry = self.registry.clone();
            let clock = self.clock.clone();
            let interval = Duration::from_secs(self.config.workers.heartbeat_interval_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    clock.sleep(interval).await;
                    if let Err(e) = registry.run_health_scan_once().await {
                        warn!(error = %e, "Health scan failed");
                    }
                }
            }));
        }

        // Session timeout scanner
        {
            let sessions = self.sessions.clone();
            let clock = self.clock.clone();
            let interval = Duration::from_secs(self.config.sessions.cleanup_interval_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    clock.sleep(interval).await;
                    if let Err(e) = sessions.run_timeout_scan_once().await {
                        warn!(error = %e, "Session timeout scan failed");
                    }
                }
            }));
        }

        // Tracker broadcast loop
        tasks.push(tokio::spawn(
            self.tracker.clone().run_flush_loop(self.clock.clone()),
        ));

        // Worker heartbeats arrive over the backend pub/sub channel
        {
            let registry = self.registry.clone();
            let mut sub = self.backend.subscribe("resources:heartbeat").await?;
            tasks.push(tokio::spawn(async move {
                while let Some(message) = sub.recv().await {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        if let Err(e) = registry.record_heartbeat(id).await {
                            warn!(error = %e, "Heartbeat handling failed");
                        }
                    }
                }
            }));
        }

        // Forced removal compensation: release stale session claims
        {
            let sessions = self.sessions.clone();
            let mut sub = self.bus.subscribe(Some("resource:forced_removal"));
            tasks.push(tokio::spawn(async move {
                while let Some(event) = sub.rx.recv().await {
                    if let Some(id) = event.payload.get("resource_id").and_then(Value::as_str) {
                        if let Err(e) = sessions.release_claims_for_resource(id).await {
                            warn!(error = %e, "Stale claim release failed");
                        }
                    }
                }
            }));
        }

        // Feed every bus event into the tracker accumulator
        {
            let tracker = self.tracker.clone();
            let mut sub = self.bus.subscribe(None);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = sub.rx.recv().await {
                    tracker.record_event(&event.topic, "info", None, event.payload.clone());
                    match event.topic.split(':').next() {
                        Some("resource") => tracker.record_resource_change(event.payload),
                        Some("session") | Some("activity") => {
                            tracker.record_session_change(event.payload)
                        }
                        Some("build") => tracker.record_build_change(event.payload),
                        _ => {}
                    }
                }
            }));
        }

        // Auto-build trigger with debounced rescheduling
        if self.config.auto_build.enabled {
            let daemon = self.clone();
            let mut sub = self.bus.subscribe(Some("changes:batched"));
            let delay = Duration::from_millis(self.config.auto_build.delay_ms);
            tasks.push(tokio::spawn(async move {
                let mut pending: Option<Vec<String>> = None;
                loop {
                    tokio::select! {
                        event = sub.rx.recv() => {
                            let Some(event) = event else { break };
                            let Ok(batch) = serde_json::from_value::<ChangeBatch>(event.payload) else {
                                continue;
                            };
                            if batch.impact >= ChangeImpact::Local {
                                // A fresh batch supersedes the scheduled timer
                                pending = Some(daemon.targets_from_batch(&batch));
                            }
                        }
                        _ = daemon.clock.sleep(delay), if pending.is_some() => {
                            let Some(targets) = pending.take() else { continue };
                            info!(targets = ?targets, "Auto-build firing");
                            let options = BuildOptions {
                                incremental: true,
                                ..Default::default()
                            };
                            if let Err(e) = daemon
                                .request_build(targets, Actor::system(), options)
                                .await
                            {
                                warn!(error = %e, "Auto-build failed");
                            }
                        }
                    }
                }
            }));
        }

        if self.config.watch.enabled {
            self.watcher.start()?;
        }
        self.tasks.lock().extend(tasks);
        info!(daemon_id = %self.config.daemon.id, "Master daemon started");
        Ok(())
    }

    /// Stop watchers and periodic tasks; flush the tracker once more
    pub async fn stop(&self) {
        self.watcher.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.tracker.flush_once();
        *self.started_at.write() = None;
        info!(daemon_id = %self.config.daemon.id, "Master daemon stopped");
    }

    /// Targets from batch paths: `packages/<X>` and `apps/<X>`, default
    /// otherwise, sorted by build priority
    fn targets_from_batch(&self, batch: &ChangeBatch) -> Vec<String> {
        let mut targets: Vec<String> = batch
            .events
            .iter()
            .map(|e| {
                classify::package_of(&e.path)
                    .unwrap_or_else(|| self.config.auto_build.default_target.clone())
            })
            .collect();
        targets.sort();
        targets.dedup();
        targets.sort_by(|a, b| {
            crate::orchestrate::target_priority(b, &self.config.build)
                .cmp(&crate::orchestrate::target_priority(a, &self.config.build))
                .then_with(|| a.cmp(b))
        });
        targets
    }

    /// Submit a build, waiting for a free slot when at the limit
    pub async fn request_build(
        &self,
        targets: Vec<String>,
        actor: Actor,
        options: BuildOptions,
    ) -> DaemonResult<BuildResult> {
        let _permit = self
            .build_slots
            .acquire()
            .await
            .map_err(|e| DaemonError::Internal(format!("Build slots closed: {}", e)))?;
        let mut request = BuildRequest::new(targets, actor);
        request.options = options;
        let result = self.orchestrator.conduct_build(request).await?;
        self.tracker.record_build_change(json!({
            "build_id": result.build_id,
            "status": result.status,
            "bundles_completed": result.bundles_completed,
            "bundles_failed": result.bundles_failed,
        }));
        Ok(result)
    }

    /// Assemble the full dashboard state and refresh the tracker snapshot
    pub async fn get_dashboard_state(&self) -> DaemonResult<Value> {
        let resources = self.registry.list().await;
        let resource_stats = self.registry.get_stats().await;
        let sessions = self.sessions.list_active().await;
        let builds = self.orchestrator.recent_builds(20).await;
        let ledger_stats = self.ledger.stats().await?;
        let state = json!({
            "daemon": {
                "id": self.config.daemon.id,
                "cluster": self.config.daemon.cluster_name,
                "uptime_secs": self.uptime_secs(),
            },
            "resources": resources,
            "resource_stats": resource_stats,
            "sessions": sessions,
            "builds": builds,
            "ledger": ledger_stats,
            "recent_events": self.tracker.get_recent_events(50),
            "timestamp": self.clock.now(),
        });
        self.tracker.set_full_state(state.clone());
        Ok(state)
    }

    fn uptime_secs(&self) -> i64 {
        (*self.started_at.read())
            .map(|t| (self.clock.now() - t).num_seconds())
            .unwrap_or(0)
    }

    /// Liveness report for the health endpoint
    pub fn health(&self) -> Value {
        json!({
            "status": if self.started_at.read().is_some() { "ok" } else { "stopped" },
            "daemon_id": self.config.daemon.id,
            "cluster": self.config.daemon.cluster_name,
            "uptime_secs": self.uptime_secs(),
            "stream_subscribers": self.tracker.subscriber_count(),
        })
    }

    pub fn config(&self) -> &BuildNetConfig {
        &self.config
    }

    pub fn get_ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    pub fn get_resources(&self) -> Arc<ResourceRegistry> {
        self.registry.clone()
    }

    pub fn get_sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub fn get_orchestrator(&self) -> Arc<BuildOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn get_tracker(&self) -> Arc<ActivityTracker> {
        self.tracker.clone()
    }

    pub fn get_watcher(&self) -> Arc<FileWatcher> {
        self.watcher.clone()
    }

    pub fn get_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }
}
