//! Configuration loading
//!
//! Loading hierarchy: env > file > defaults.

use crate::schema::BuildNetConfig;
use crate::ConfigError;
use std::path::Path;

/// Load configuration, applying the env > file > defaults hierarchy
///
/// `path` is optional; a missing file falls back to defaults rather than
/// erroring, so a bare daemon start works out of the box.
pub fn load_config(path: Option<&Path>) -> Result<BuildNetConfig, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => load_from_file(path)?,
        _ => BuildNetConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a TOML configuration file
pub fn load_from_file(path: &Path) -> Result<BuildNetConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid {}: {}", key, value)))
}

/// Apply `BUILDNET_*` environment variable overrides
pub fn apply_env_overrides(config: &mut BuildNetConfig) -> Result<(), ConfigError> {
    use std::env;

    if let Ok(id) = env::var("BUILDNET_DAEMON_ID") {
        config.daemon.id = id;
    }
    if let Ok(cluster) = env::var("BUILDNET_CLUSTER") {
        config.daemon.cluster_name = cluster;
    }
    if let Ok(dir) = env::var("BUILDNET_DATA_DIR") {
        config.daemon.data_dir = dir;
    }
    if let Ok(bind) = env::var("BUILDNET_BIND") {
        config.network.bind = bind.clone();
        config.network.advertise = bind;
    }
    if let Ok(value) = env::var("BUILDNET_DEBOUNCE_MS") {
        config.watch.debounce_ms = parse_env("BUILDNET_DEBOUNCE_MS", &value)?;
    }
    if let Ok(value) = env::var("BUILDNET_AUTO_BUILD") {
        config.auto_build.enabled = parse_env("BUILDNET_AUTO_BUILD", &value)?;
    }
    if let Ok(value) = env::var("BUILDNET_AUTO_BUILD_DELAY_MS") {
        config.auto_build.delay_ms = parse_env("BUILDNET_AUTO_BUILD_DELAY_MS", &value)?;
    }
    if let Ok(value) = env::var("BUILDNET_MAX_CONCURRENT_BUILDS") {
        config.auto_build.max_concurrent_builds =
            parse_env("BUILDNET_MAX_CONCURRENT_BUILDS", &value)?;
    }
    if let Ok(value) = env::var("BUILDNET_SESSION_TIMEOUT_SECS") {
        config.sessions.session_timeout_secs =
            parse_env("BUILDNET_SESSION_TIMEOUT_SECS", &value)?;
    }
    if let Ok(path) = env::var("BUILDNET_AUDIT_MIRROR") {
        config.audit.mirror_path = path;
    }
    Ok(())
}

/// Validate ranges and addresses
pub fn validate_config(config: &BuildNetConfig) -> Result<(), ConfigError> {
    if config.network.bind.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Validation(format!(
            "network.bind is not a socket address: {}",
            config.network.bind
        )));
    }
    if config.watch.debounce_ms == 0 {
        return Err(ConfigError::Validation(
            "watch.debounce_ms must be non-zero".to_string(),
        ));
    }
    if config.workers.heartbeat_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "workers.heartbeat_interval_secs must be non-zero".to_string(),
        ));
    }
    if config.sessions.cleanup_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "sessions.cleanup_interval_secs must be non-zero".to_string(),
        ));
    }
    if config.auto_build.max_concurrent_builds == 0 {
        return Err(ConfigError::Validation(
            "auto_build.max_concurrent_builds must be non-zero".to_string(),
        ));
    }
    if config.tracker.broadcast_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "tracker.broadcast_interval_ms must be non-zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BuildNetConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.watch.debounce_ms, 300);
        assert_eq!(config.auto_build.delay_ms, 2_000);
        assert_eq!(config.auto_build.max_concurrent_builds, 3);
        assert_eq!(config.workers.heartbeat_interval_secs, 5);
        assert_eq!(config.sessions.session_timeout_secs, 3_600);
        assert_eq!(config.sessions.max_sessions_per_actor, 10);
    }

    #[test]
    fn partial_file_inherits_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("buildnet.toml");
        std::fs::write(
            &path,
            r#"
[daemon]
cluster_name = "ci"

[auto_build]
delay_ms = 500
"#,
        )
        .unwrap();

        let config = load_from_file(&path).unwrap();
        assert_eq!(config.daemon.cluster_name, "ci");
        assert_eq!(config.auto_build.delay_ms, 500);
        // Untouched sections keep defaults
        assert_eq!(config.watch.debounce_ms, 300);
        assert_eq!(config.auto_build.max_concurrent_builds, 3);
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let mut config = BuildNetConfig::default();
        config.network.bind = "not-an-address".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn zero_debounce_is_rejected() {
        let mut config = BuildNetConfig::default();
        config.watch.debounce_ms = 0;
        assert!(validate_config(&config).is_err());
    }
}
