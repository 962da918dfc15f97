//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the local database file.
    pub db_path: PathBuf,
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: SocketAddr,
    /// Worker command line (program + base args); the task name is appended
    /// as the final argument at launch.
    pub worker_cmd: Vec<String>,
    /// Override for the platform sleep-guard command. `None` selects the
    /// platform default.
    pub guard_cmd: Option<Vec<String>>,
    /// Directory for daily-rolling log files.
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/webpilot.db"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            worker_cmd: vec!["webpilot-worker".to_string()],
            guard_cmd: None,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Build a config from `WEBPILOT_*` environment variables. Unset
    /// variables fall back to defaults; variables that are set but unusable
    /// are an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("WEBPILOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let bind_addr = match std::env::var("WEBPILOT_BIND_ADDR") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "WEBPILOT_BIND_ADDR".to_string(),
                message: format!("{raw:?} is not a socket address: {e}"),
            })?,
            Err(_) => defaults.bind_addr,
        };

        let worker_cmd = match std::env::var("WEBPILOT_WORKER_CMD") {
            Ok(raw) => split_command(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "WEBPILOT_WORKER_CMD".to_string(),
                message: "command is empty".to_string(),
            })?,
            Err(_) => defaults.worker_cmd,
        };

        // An empty guard override means "use the platform default".
        let guard_cmd = std::env::var("WEBPILOT_GUARD_CMD")
            .ok()
            .and_then(|raw| split_command(&raw));

        let log_dir = std::env::var("WEBPILOT_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);

        Ok(Self {
            db_path,
            bind_addr,
            worker_cmd,
            guard_cmd,
            log_dir,
        })
    }
}

/// Split a command line on whitespace. No quoting support; worker and guard
/// commands that need shell features should point at a wrapper script.
fn split_command(raw: &str) -> Option<Vec<String>> {
    let parts: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() { None } else { Some(parts) }
}
