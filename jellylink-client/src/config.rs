use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use jellylink_core::{DEFAULT_PROBE_TIMEOUT, DEFAULT_RETRY_INTERVAL};
use tracing_subscriber::EnvFilter;

pub const CONFIG_DIR_ENV: &str = "JELLYLINK_CONFIG_DIR";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "Jellylink";
/// Used when `RUST_LOG` is unset or blank.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Requests issued by one probe: existence check, one redirect, metadata.
const REQUESTS_PER_PROBE: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub probe_timeout: Duration,
    pub retry_interval: Duration,
    pub user_agent: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            user_agent: default_user_agent(),
        }
    }
}

impl ConnectConfig {
    /// Upper bound for a whole probe of one candidate.
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        self.probe_timeout.saturating_mul(REQUESTS_PER_PROBE)
    }
}

pub fn default_user_agent() -> String {
    format!("jellylink/{}", env!("CARGO_PKG_VERSION"))
}

pub fn config_dir(override_dir: Option<&Path>) -> PathBuf {
    let dir = if let Some(dir) = override_dir {
        dir.to_path_buf()
    } else if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        PathBuf::from(dir)
    } else {
        platform_config_base().join(APP_DIR_NAME)
    };
    let _ = std::fs::create_dir_all(&dir);
    dir
}

pub fn settings_path(override_dir: Option<&Path>) -> PathBuf {
    config_dir(override_dir).join(SETTINGS_FILE_NAME)
}

/// Builds the log filter from `RUST_LOG`-style directives.
pub fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn platform_config_base() -> PathBuf {
    let candidates = if cfg!(target_os = "windows") {
        vec![std::env::var_os("LOCALAPPDATA").map(PathBuf::from)]
    } else {
        vec![
            std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")),
        ]
    };
    candidates
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::*;

    #[test]
    fn defaults_match_connection_contract() {
        let config = ConnectConfig::default();
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert!(config.user_agent.starts_with("jellylink/"));
        assert_eq!(config.attempt_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn log_filter_defaults_to_info() {
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(Some("  ")).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(Some("debug")).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn explicit_dir_wins() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = settings_path(Some(dir.path()));
        assert_eq!(path, dir.path().join(SETTINGS_FILE_NAME));
    }
}
