//! Sleep guard — keeps the host awake while scheduled work is pending.
//!
//! Wraps a long-running platform utility (`caffeinate` on macOS,
//! `systemd-inhibit` on other unix) as a child process. Everything here
//! is best effort: a guard that fails to start logs a warning and
//! scheduling carries on without it.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SpawnError;

/// Holds the guard child process, if one is running.
pub struct SleepGuard {
    command: Option<Vec<String>>,
    child: Mutex<Option<Child>>,
}

impl SleepGuard {
    /// Build from an explicit command override, falling back to the
    /// platform default. On platforms without a known utility the guard
    /// is disabled and `start` becomes a no-op.
    pub fn new(override_cmd: Option<Vec<String>>) -> Self {
        let command = override_cmd.or_else(platform_guard_command);
        if command.is_none() {
            warn!("No sleep guard command available on this platform; guard disabled");
        }
        Self {
            command,
            child: Mutex::new(None),
        }
    }

    /// Start the guard process unless one is already alive.
    /// Returns whether a guard is running afterwards.
    pub async fn start(&self) -> bool {
        let Some(cmd) = &self.command else {
            return false;
        };
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(None) => return true,
                // Exited on its own; reap and restart below.
                _ => *slot = None,
            }
        }
        match spawn_guard(cmd) {
            Ok(child) => {
                debug!(command = cmd.join(" "), "Sleep guard started");
                *slot = Some(child);
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to start sleep guard");
                false
            }
        }
    }

    /// Kill the guard process if running.
    pub async fn stop(&self) {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill sleep guard");
            } else {
                debug!("Sleep guard stopped");
            }
        }
    }

    /// Whether a guard process is currently alive.
    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                _ => {
                    *slot = None;
                    false
                }
            },
            None => false,
        }
    }
}

fn spawn_guard(cmd: &[String]) -> Result<Child, SpawnError> {
    let (program, args) = cmd.split_first().ok_or_else(|| SpawnError::Guard {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty guard command"),
    })?;
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SpawnError::Guard {
            program: program.clone(),
            source,
        })
}

/// Default guard utility for the current platform.
fn platform_guard_command() -> Option<Vec<String>> {
    #[cfg(target_os = "macos")]
    {
        Some(vec!["caffeinate".into(), "-di".into()])
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        Some(vec![
            "systemd-inhibit".into(),
            "--what=sleep".into(),
            "--who=webpilot".into(),
            "--why=Scheduled browser tasks pending".into(),
            "sleep".into(),
            "infinity".into(),
        ])
    }
    #[cfg(not(unix))]
    {
        None
    }
}
