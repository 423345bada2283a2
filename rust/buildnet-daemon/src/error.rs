//! Error types for the daemon

use buildnet_ledger::LedgerError;
use buildnet_state::BackendError;
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error taxonomy with stable codes
#[derive(Debug, Error)]
pub enum DaemonError {
    /// State backend failed or timed out
    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),

    /// Ledger write or query failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Entity lookup by id missed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Mutation conflicts with current state (e.g. remove with claims)
    #[error("Conflicting state: {0}")]
    ConflictingState(String),

    /// Session create over the per-actor cap
    #[error("Session quota exceeded for actor {actor_id} (max {max})")]
    SessionQuotaExceeded { actor_id: String, max: usize },

    /// Build dependency graph unsatisfiable
    #[error("Build deadlock: {0}")]
    Deadlock(String),

    /// Per-bundle failure reported by a worker
    #[error("Build error: {0}")]
    Build(String),

    /// Build cancelled cooperatively
    #[error("Build cancelled")]
    Cancelled,

    /// Filesystem watcher failure
    #[error("Watcher error: {0}")]
    Watch(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Stable error code surfaced by the HTTP adapter
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::Backend(_) => "BACKEND_UNAVAILABLE",
            DaemonError::Ledger(LedgerError::LeaseUnavailable { .. }) => "LEASE_UNAVAILABLE",
            DaemonError::Ledger(LedgerError::SequenceGap { .. }) => "SEQUENCE_GAP",
            DaemonError::Ledger(LedgerError::BackendUnavailable(_)) => "BACKEND_UNAVAILABLE",
            DaemonError::Ledger(_) => "LEDGER_ERROR",
            DaemonError::NotFound { .. } => "NOT_FOUND",
            DaemonError::ConflictingState(_) => "CONFLICTING_STATE",
            DaemonError::SessionQuotaExceeded { .. } => "SESSION_QUOTA_EXCEEDED",
            DaemonError::Deadlock(_) => "DEADLOCK",
            DaemonError::Build(_) => "BUILD_ERROR",
            DaemonError::Cancelled => "CANCELLED",
            DaemonError::Watch(_) => "WATCH_ERROR",
            DaemonError::Internal(_) => "INTERNAL",
        }
    }
}
