//! Build orchestrator
//!
//! Phase-structured conductor: prepare micro-bundles, score worker
//! assignments, perform with dependency-aware parallel dispatch and retry,
//! verify artifacts. Fully testable without a real bundler.

pub mod executor;
pub mod retry;
pub mod score;

pub use executor::{BundleExecutor, SimulatedExecutor};
pub use retry::{execute_bundle_with_retry, RetryPolicy};
pub use score::{plan, prepare_bundles, sort_by_priority, target_priority};

use crate::clock::Clock;
use crate::error::{DaemonError, DaemonResult};
use crate::events::EventBus;
use crate::registry::{Resource, ResourceRegistry};
use buildnet_config::{BuildSection, WorkerSection};
use buildnet_ledger::{Actor, Ledger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

const RECENT_BUILDS_LIMIT: usize = 50;

/// File globs and flags describing a bundle's chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub globs: Vec<String>,
    pub entry: bool,
    pub critical_path: bool,
}

/// Atomic unit of build work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroBundle {
    pub id: String,
    pub package: String,
    pub entry: String,
    pub chunk: ChunkSpec,
    /// Bundle ids that must complete first
    pub dependencies: Vec<String>,
    pub estimated_size_kb: u64,
    pub estimated_time_ms: u64,
    /// Higher runs earlier, ceteris paribus
    pub priority: i32,
}

/// One bundle's planned placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartAssignment {
    pub bundle_id: String,
    pub worker_id: String,
    pub estimated_start_ms: u64,
    pub estimated_duration_ms: u64,
    pub dependencies: Vec<String>,
}

/// The execution plan produced by the score phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildScore {
    pub bundles: Vec<MicroBundle>,
    pub assignments: Vec<PartAssignment>,
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    pub critical_path: Vec<String>,
    pub estimated_duration_ms: u64,
}

/// Build options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub incremental: bool,
    pub watch: bool,
    pub clean: bool,
    pub verbose: bool,
    /// Pin a specific bundler capability
    pub bundler: Option<String>,
}

/// A request to build a set of targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub request_id: String,
    pub actor: Actor,
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: BuildOptions,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Explicit bundle override; targets derive bundles when absent
    #[serde(default)]
    pub bundles: Option<Vec<MicroBundle>>,
}

impl BuildRequest {
    pub fn new(targets: Vec<String>, actor: Actor) -> Self {
        Self {
            request_id: format!("build-{}", Uuid::new_v4()),
            actor,
            targets,
            options: BuildOptions::default(),
            priority: 0,
            created_at: Utc::now(),
            bundles: None,
        }
    }
}

/// Terminal build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failed,
    Cancelled,
}

/// One taxonomized build error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildErrorInfo {
    pub code: String,
    pub bundle_id: Option<String>,
    pub message: String,
}

/// Result of one bundle's execution (after retries)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleOutcome {
    pub bundle_id: String,
    pub worker_id: String,
    pub success: bool,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub attempts: u32,
}

/// Aggregate result of a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub build_id: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub bundles_completed: usize,
    pub bundles_failed: usize,
    pub artifacts: Vec<String>,
    pub errors: Vec<BuildErrorInfo>,
}

/// Point-in-time view of a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSnapshot {
    pub build_id: String,
    pub state: String,
    pub bundles_total: usize,
    pub bundles_completed: usize,
    pub bundles_failed: usize,
    pub started_at: DateTime<Utc>,
    pub status: Option<BuildStatus>,
}

struct ActiveBuild {
    cancelled: AtomicBool,
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    started_at: DateTime<Utc>,
}

/// Ends the ledger correlation scope on every exit path
struct CorrelationScope {
    ledger: Arc<Ledger>,
}

impl Drop for CorrelationScope {
    fn drop(&mut self) {
        self.ledger.end_correlation();
    }
}

/// The conductor
pub struct BuildOrchestrator {
    ledger: Arc<Ledger>,
    registry: Arc<ResourceRegistry>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn BundleExecutor>,
    build_config: BuildSection,
    worker_config: WorkerSection,
    active: RwLock<HashMap<String, Arc<ActiveBuild>>>,
    recent: RwLock<VecDeque<BuildResult>>,
}

impl BuildOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        registry: Arc<ResourceRegistry>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn BundleExecutor>,
        build_config: BuildSection,
        worker_config: WorkerSection,
    ) -> Self {
        Self {
            ledger,
            registry,
            bus,
            clock,
            executor,
            build_config,
            worker_config,
            active: RwLock::new(HashMap::new()),
            recent: RwLock::new(VecDeque::new()),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.build_config.max_retries.max(1),
            base_delay: std::time::Duration::from_millis(self.build_config.retry_delay_ms),
        }
    }

    /// Run a build request through all four phases
    ///
    /// Failures become a `failed` result rather than an error; only the
    /// initial ledger write can fail the call itself.
    pub async fn conduct_build(&self, request: BuildRequest) -> DaemonResult<BuildResult> {
        let build_id = request.request_id.clone();
        let correlation = self.ledger.start_correlation();
        let _scope = CorrelationScope {
            ledger: self.ledger.clone(),
        };
        let started_at = self.clock.now();

        let running_state = json!({
            "build_id": build_id,
            "targets": request.targets,
            "status": "running",
            "actor_id": request.actor.id,
            "incremental": request.options.incremental,
        });
        self.ledger
            .record_change(
                "build",
                &build_id,
                None,
                Some(running_state.clone()),
                &request.actor,
                "build started",
                Some(correlation),
            )
            .await?;
        self.bus.emit(
            "build:started",
            json!({"build_id": build_id, "targets": request.targets}),
        );
        info!(build_id = %build_id, targets = ?request.targets, "Build started");

        let result = match self.run_phases(&request, &build_id, started_at).await {
            Ok(result) => result,
            Err(e) => {
                let code = match &e {
                    DaemonError::Deadlock(_) => "DEADLOCK",
                    _ => "ORCHESTRATION_ERROR",
                };
                let finished_at = self.clock.now();
                BuildResult {
                    build_id: build_id.clone(),
                    status: BuildStatus::Failed,
                    started_at,
                    finished_at,
                    duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
                    bundles_completed: 0,
                    bundles_failed: 0,
                    artifacts: Vec::new(),
                    errors: vec![BuildErrorInfo {
                        code: code.to_string(),
                        bundle_id: None,
                        message: e.to_string(),
                    }],
                }
            }
        };

        self.active.write().await.remove(&build_id);

        let final_state = json!({
            "build_id": build_id,
            "targets": request.targets,
            "status": result.status,
            "actor_id": request.actor.id,
            "incremental": request.options.incremental,
        });
        self.ledger
            .record_change(
                "build",
                &build_id,
                Some(running_state),
                Some(final_state),
                &request.actor,
                "build finished",
                Some(correlation),
            )
            .await?;
        let result_state = serde_json::to_value(&result)
            .map_err(|e| DaemonError::Internal(format!("Result serialization error: {}", e)))?;
        self.ledger
            .record_change(
                "build_result",
                &build_id,
                None,
                Some(result_state),
                &request.actor,
                "build result recorded",
                Some(correlation),
            )
            .await?;
        self.bus.emit(
            "build:completed",
            json!({"build_id": build_id, "status": result.status}),
        );
        info!(build_id = %build_id, status = ?result.status, "Build finished");

        let mut recent = self.recent.write().await;
        recent.push_back(result.clone());
        while recent.len() > RECENT_BUILDS_LIMIT {
            recent.pop_front();
        }
        Ok(result)
    }

    async fn run_phases(
        &self,
        request: &BuildRequest,
        build_id: &str,
        started_at: DateTime<Utc>,
    ) -> DaemonResult<BuildResult> {
        // Phase 1: prepare
        let mut bundles = match &request.bundles {
            Some(explicit) => explicit.clone(),
            None => prepare_bundles(&request.targets, &self.build_config),
        };
        sort_by_priority(&mut bundles);

        if bundles.is_empty() {
            let finished_at = self.clock.now();
            return Ok(BuildResult {
                build_id: build_id.to_string(),
                status: BuildStatus::Success,
                started_at,
                finished_at,
                duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
                bundles_completed: 0,
                bundles_failed: 0,
                artifacts: Vec::new(),
                errors: Vec::new(),
            });
        }

        // Phase 2: score against the workers available right now
        let workers = self.registry.get_available_workers().await;
        if workers.is_empty() {
            return Err(DaemonError::Build("no available workers".to_string()));
        }
        let score = plan(
            &bundles,
            &workers,
            &request.options,
            self.worker_config.max_load_ms,
        );
        let worker_by_id: HashMap<String, Resource> =
            workers.into_iter().map(|w| (w.id.clone(), w)).collect();
        let assignment_of: HashMap<String, String> = score
            .assignments
            .iter()
            .map(|a| (a.bundle_id.clone(), a.worker_id.clone()))
            .collect();

        let active = Arc::new(ActiveBuild {
            cancelled: AtomicBool::new(false),
            total: bundles.len(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            started_at,
        });
        self.active
            .write()
            .await
            .insert(build_id.to_string(), active.clone());

        // Phase 3: perform
        let mut pending: BTreeMap<String, MicroBundle> =
            bundles.iter().map(|b| (b.id.clone(), b.clone())).collect();
        let mut outcomes: BTreeMap<String, BundleOutcome> = BTreeMap::new();
        let mut cancelled = false;
        let mut deadlock = false;

        while !pending.is_empty() {
            if active.cancelled.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            let ready: Vec<MicroBundle> = pending
                .values()
                .filter(|b| b.dependencies.iter().all(|d| outcomes.contains_key(d)))
                .cloned()
                .collect();
            if ready.is_empty() {
                deadlock = true;
                break;
            }

            let mut batch = JoinSet::new();
            for bundle in ready {
                pending.remove(&bundle.id);
                let Some(worker_id) = assignment_of.get(&bundle.id) else {
                    // Planning covered every bundle; a miss is a logic error
                    return Err(DaemonError::Internal(format!(
                        "bundle {} was never assigned",
                        bundle.id
                    )));
                };
                let Some(worker) = worker_by_id.get(worker_id).cloned() else {
                    return Err(DaemonError::Internal(format!(
                        "worker {} vanished from the plan",
                        worker_id
                    )));
                };
                let executor = self.executor.clone();
                let clock = self.clock.clone();
                let options = request.options.clone();
                let policy = self.retry_policy();
                batch.spawn(async move {
                    execute_bundle_with_retry(executor, &bundle, &worker, &options, policy, clock)
                        .await
                });
            }
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(outcome) => {
                        if outcome.success {
                            active.completed.fetch_add(1, Ordering::SeqCst);
                        } else {
                            active.failed.fetch_add(1, Ordering::SeqCst);
                        }
                        outcomes.insert(outcome.bundle_id.clone(), outcome);
                    }
                    Err(e) => warn!(error = %e, "Bundle task aborted"),
                }
            }
        }

        // Phase 4: verify
        if self.build_config.verify_artifacts {
            for outcome in outcomes.values() {
                if outcome.success && outcome.artifacts.is_empty() {
                    warn!(bundle = %outcome.bundle_id, "Successful bundle produced no artifacts");
                    self.bus.emit(
                        "verification:warning",
                        json!({
                            "build_id": build_id,
                            "bundle_id": outcome.bundle_id,
                            "message": "bundle reported success with no artifacts",
                        }),
                    );
                }
            }
        }

        // Aggregate
        let bundles_completed = outcomes.values().filter(|o| o.success).count();
        let bundles_failed = outcomes.values().filter(|o| !o.success).count();
        let artifacts: Vec<String> = outcomes
            .values()
            .filter(|o| o.success)
            .flat_map(|o| o.artifacts.iter().cloned())
            .collect();
        let mut errors: Vec<BuildErrorInfo> = outcomes
            .values()
            .filter(|o| !o.success)
            .map(|o| BuildErrorInfo {
                code: o
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "BUILD_ERROR".to_string()),
                bundle_id: Some(o.bundle_id.clone()),
                message: o
                    .error
                    .clone()
                    .unwrap_or_else(|| "bundle failed".to_string()),
            })
            .collect();

        let status = if cancelled {
            BuildStatus::Cancelled
        } else if deadlock {
            errors = vec![BuildErrorInfo {
                code: "DEADLOCK".to_string(),
                bundle_id: None,
                message: format!(
                    "dependency graph unsatisfiable; {} bundles can never become ready",
                    pending.len()
                ),
            }];
            BuildStatus::Failed
        } else if bundles_failed > 0 {
            BuildStatus::Failed
        } else {
            BuildStatus::Success
        };

        let finished_at = self.clock.now();
        Ok(BuildResult {
            build_id: build_id.to_string(),
            status,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            bundles_completed,
            bundles_failed,
            artifacts,
            errors,
        })
    }

    /// Flag a running build for cooperative cancellation
    pub async fn cancel_build(&self, build_id: &str, actor: &Actor) -> DaemonResult<bool> {
        let active = self.active.read().await;
        let Some(build) = active.get(build_id) else {
            return Ok(false);
        };
        build.cancelled.store(true, Ordering::SeqCst);
        drop(active);

        self.ledger
            .record_change(
                "build",
                build_id,
                Some(json!({"build_id": build_id, "status": "running"})),
                Some(json!({"build_id": build_id, "status": "cancelling"})),
                actor,
                "build cancelled",
                None,
            )
            .await?;
        self.bus
            .emit("build:cancelled", json!({"build_id": build_id}));
        Ok(true)
    }

    /// Snapshot of a running or recently finished build
    pub async fn get_build_status(&self, build_id: &str) -> Option<BuildSnapshot> {
        {
            let active = self.active.read().await;
            if let Some(build) = active.get(build_id) {
                return Some(BuildSnapshot {
                    build_id: build_id.to_string(),
                    state: "running".to_string(),
                    bundles_total: build.total,
                    bundles_completed: build.completed.load(Ordering::SeqCst),
                    bundles_failed: build.failed.load(Ordering::SeqCst),
                    started_at: build.started_at,
                    status: None,
                });
            }
        }
        let recent = self.recent.read().await;
        recent.iter().rev().find(|r| r.build_id == build_id).map(|r| BuildSnapshot {
            build_id: r.build_id.clone(),
            state: "finished".to_string(),
            bundles_total: r.bundles_completed + r.bundles_failed,
            bundles_completed: r.bundles_completed,
            bundles_failed: r.bundles_failed,
            started_at: r.started_at,
            status: Some(r.status),
        })
    }

    /// Most recent build results, newest last
    pub async fn recent_builds(&self, limit: usize) -> Vec<BuildResult> {
        let recent = self.recent.read().await;
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
}
