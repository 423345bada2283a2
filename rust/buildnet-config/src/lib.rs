// rust/buildnet-config/src/lib.rs
// Configuration schema, defaults, and file/env loading for the daemon

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod load;
pub mod schema;

pub use load::{apply_env_overrides, load_config, load_from_file, validate_config};
pub use schema::{
    AuditSection, AutoBuildSection, BuildNetConfig, BuildSection, DaemonSection, NetworkSection,
    SessionSection, TrackerSection, WatchSection, WorkerSection,
};

use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
