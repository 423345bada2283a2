//! Configuration schema
//!
//! One top-level record with a section per subsystem. Every field has a
//! default so a missing file or a partial file both work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildNetConfig {
    pub daemon: DaemonSection,
    pub watch: WatchSection,
    pub auto_build: AutoBuildSection,
    pub workers: WorkerSection,
    pub sessions: SessionSection,
    pub build: BuildSection,
    pub tracker: TrackerSection,
    pub network: NetworkSection,
    pub audit: AuditSection,
}

/// Daemon identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub id: String,
    pub cluster_name: String,
    pub data_dir: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            id: "buildnet-master".to_string(),
            cluster_name: "default".to_string(),
            data_dir: "./buildnet-data".to_string(),
        }
    }
}

/// File watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub enabled: bool,
    /// Roots to watch
    pub paths: Vec<String>,
    /// Include globs; empty means everything
    pub include: Vec<String>,
    /// Exclude globs; defaults cover build output, VCS metadata, caches
    pub exclude: Vec<String>,
    pub debounce_ms: u64,
    pub preemptive_prepare: bool,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: vec![".".to_string()],
            include: Vec::new(),
            exclude: vec![
                "**/node_modules/**".to_string(),
                "**/dist/**".to_string(),
                "**/build/**".to_string(),
                "**/target/**".to_string(),
                "**/.git/**".to_string(),
                "**/.cache/**".to_string(),
            ],
            debounce_ms: 300,
            preemptive_prepare: false,
        }
    }
}

/// Auto-build trigger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBuildSection {
    pub enabled: bool,
    pub delay_ms: u64,
    pub max_concurrent_builds: usize,
    pub default_target: String,
    /// Configuration hook for redundant dispatch; currently unused by the
    /// orchestrator
    pub redundancy_factor: u32,
}

impl Default for AutoBuildSection {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 2_000,
            max_concurrent_builds: 3,
            default_target: "core".to_string(),
            redundancy_factor: 1,
        }
    }
}

/// Worker-pool health settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub heartbeat_interval_secs: u64,
    pub missed_threshold: u32,
    pub hard_eject_secs: u64,
    /// Load normalizer for assignment scoring, in milliseconds
    pub max_load_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            missed_threshold: 3,
            hard_eject_secs: 300,
            max_load_ms: 60_000,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_sessions_per_actor: usize,
    pub session_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub activity_history_limit: usize,
    pub activity_log_limit: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions_per_actor: 10,
            session_timeout_secs: 3_600,
            cleanup_interval_secs: 60,
            activity_history_limit: 100,
            activity_log_limit: 1_000,
        }
    }
}

/// Build execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub verify_artifacts: bool,
    /// Per-target priority overrides merged over the built-in ordering
    pub target_priorities: BTreeMap<String, i32>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            verify_artifacts: true,
            target_priorities: BTreeMap::new(),
        }
    }
}

/// Activity tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    pub broadcast_interval_ms: u64,
    pub recent_events_limit: usize,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 100,
            recent_events_limit: 1_000,
        }
    }
}

/// Network bind/advertise
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub bind: String,
    pub advertise: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7430".to_string(),
            advertise: "127.0.0.1:7430".to_string(),
        }
    }
}

/// Audit/ledger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    /// Append-only mirror file; empty disables mirroring
    pub mirror_path: String,
    pub stream_enabled: bool,
    pub retention_days: u32,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            mirror_path: String::new(),
            stream_enabled: true,
            retention_days: 90,
        }
    }
}
