//! Worker supervision — launching task worker processes and converting their
//! output into typed events.
//!
//! The worker binary is opaque: it receives the task name as its final
//! argument, writes status protocol lines to stdout (see [`crate::protocol`])
//! and free-form logs to either stream, then exits. The supervisor never
//! writes to the worker; crashes that happen before a terminal marker are
//! inferred from the exit code.

use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SpawnError;
use crate::protocol::{self, ErrorType, StatusEvent};

/// Per-worker event channel depth. Workers that outrun a stalled consumer
/// back-pressure on their pipes rather than ballooning memory.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How a run came to be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Cron,
    Oneshot,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Cron => "cron",
            TriggerKind::Oneshot => "oneshot",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "cron" => Ok(TriggerKind::Cron),
            "oneshot" => Ok(TriggerKind::Oneshot),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// Ephemeral identity of one launched worker run. Plain data — the process
/// itself is owned by the monitor task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub task_name: String,
    pub process_id: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub trigger: TriggerKind,
}

/// Which stream a worker log line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Typed events one supervised worker produces, in emission order.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A decoded protocol event. Includes failures synthesized from a
    /// non-zero exit when the worker never reported `FAILED` itself.
    Status(StatusEvent),
    /// A non-protocol output line, forwarded verbatim.
    Log { stream: OutputStream, line: String },
    /// Process exit. `ambiguous` marks a clean exit without any terminal
    /// status marker.
    Exited {
        exit_code: Option<i32>,
        ambiguous: bool,
    },
}

/// Launches worker processes and wires their output into event channels.
///
/// Concurrent launches of the same task name are not serialized; a cron
/// entry firing while a prior run is still active gets a second independent
/// worker process.
#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    worker_cmd: Vec<String>,
}

impl WorkerSupervisor {
    /// `worker_cmd` is the program plus base arguments; the task name is
    /// appended at launch.
    pub fn new(worker_cmd: Vec<String>) -> Self {
        Self { worker_cmd }
    }

    /// Start a worker for `task_name` and begin streaming its events.
    ///
    /// Spawn failure is a supervisor-level error, distinct from task failure
    /// and never recorded against the task.
    pub fn launch(
        &self,
        task_name: &str,
        trigger: TriggerKind,
    ) -> Result<(RunHandle, mpsc::Receiver<WorkerEvent>), SpawnError> {
        let (program, base_args) =
            self.worker_cmd
                .split_first()
                .ok_or_else(|| SpawnError::Worker {
                    program: String::new(),
                    task: task_name.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "empty worker command",
                    ),
                })?;

        let mut child = Command::new(program)
            .args(base_args)
            .arg(task_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SpawnError::Worker {
                program: program.clone(),
                task: task_name.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe {
            task: task_name.to_string(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe {
            task: task_name.to_string(),
            stream: "stderr",
        })?;

        let handle = RunHandle {
            run_id: Uuid::new_v4(),
            task_name: task_name.to_string(),
            process_id: child.id(),
            started_at: Utc::now(),
            trigger,
        };

        info!(
            task = %task_name,
            run_id = %handle.run_id,
            pid = ?handle.process_id,
            trigger = %trigger,
            "Worker launched"
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(monitor(
            child,
            stdout,
            stderr,
            task_name.to_string(),
            tx,
        ));

        Ok((handle, rx))
    }
}

/// Read both output streams to exhaustion, then apply the exit-code policy.
async fn monitor(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    task_name: String,
    tx: mpsc::Sender<WorkerEvent>,
) {
    let stdout_lines = LinesStream::new(BufReader::new(stdout).lines())
        .map(|line| (OutputStream::Stdout, line));
    let stderr_lines = LinesStream::new(BufReader::new(stderr).lines())
        .map(|line| (OutputStream::Stderr, line));
    let mut merged = stdout_lines.merge(stderr_lines);

    let mut saw_failed = false;
    let mut saw_terminal = false;

    while let Some((stream, line)) = merged.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(task = %task_name, error = %e, "Worker output read error");
                continue;
            }
        };

        // The protocol only speaks on stdout; stderr is always log output.
        let event = if stream == OutputStream::Stdout {
            match protocol::decode_line(&line) {
                Some(status) => {
                    saw_terminal |= status.is_terminal();
                    saw_failed |= matches!(status, StatusEvent::Failed { .. });
                    WorkerEvent::Status(status)
                }
                None => WorkerEvent::Log { stream, line },
            }
        } else {
            WorkerEvent::Log { stream, line }
        };

        if tx.send(event).await.is_err() {
            // Consumer dropped; keep draining pipes so the child can exit.
            continue;
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(task = %task_name, error = %e, "Failed to collect worker exit status");
            None
        }
    };

    let clean = exit_code == Some(0);
    if !clean && !saw_failed {
        let mut context = serde_json::Map::new();
        context.insert("exitCode".to_string(), json!(exit_code.unwrap_or(-1)));
        warn!(
            task = %task_name,
            exit_code = exit_code.unwrap_or(-1),
            "Worker exited abnormally without reporting failure; synthesizing"
        );
        let _ = tx
            .send(WorkerEvent::Status(StatusEvent::Failed {
                task_name: task_name.clone(),
                error_type: ErrorType::Unknown,
                context,
            }))
            .await;
    }

    let ambiguous = clean && !saw_terminal;
    if ambiguous {
        warn!(
            task = %task_name,
            "Worker exited cleanly without a terminal status marker (ambiguous success)"
        );
    }

    let _ = tx.send(WorkerEvent::Exited { exit_code, ambiguous }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerSupervisor {
        WorkerSupervisor::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    async fn collect(mut rx: mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn clean_run_emits_started_and_completed() {
        let sup = sh(
            r#"printf '[TASK_STATUS:STARTED]{"taskName":"t"}\n[TASK_STATUS:COMPLETED]{"taskName":"t","durationMs":5}\n'"#,
        );
        let (handle, rx) = sup.launch("t", TriggerKind::Manual).unwrap();
        assert_eq!(handle.task_name, "t");
        assert!(handle.process_id.is_some());

        let events = collect(rx).await;
        assert!(matches!(
            events[0],
            WorkerEvent::Status(StatusEvent::Started { .. })
        ));
        assert!(matches!(
            events[1],
            WorkerEvent::Status(StatusEvent::Completed {
                duration_ms: Some(5),
                ..
            })
        ));
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Exited {
                exit_code: Some(0),
                ambiguous: false
            })
        ));
    }

    #[tokio::test]
    async fn nonzero_exit_without_failed_is_synthesized() {
        let sup = sh(r#"printf '[TASK_STATUS:STARTED]{"taskName":"t"}\n'; exit 1"#);
        let (_, rx) = sup.launch("t", TriggerKind::Manual).unwrap();
        let events = collect(rx).await;

        let synthesized = events.iter().find_map(|ev| match ev {
            WorkerEvent::Status(StatusEvent::Failed {
                error_type,
                context,
                ..
            }) => Some((*error_type, context.clone())),
            _ => None,
        });
        let (error_type, context) = synthesized.expect("expected synthesized FAILED");
        assert_eq!(error_type, ErrorType::Unknown);
        assert_eq!(context["exitCode"], 1);

        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Exited {
                exit_code: Some(1),
                ambiguous: false
            })
        ));
    }

    #[tokio::test]
    async fn worker_reported_failure_is_not_synthesized_twice() {
        let sup = sh(
            r#"printf '[TASK_STATUS:FAILED]{"taskName":"t","errorType":"timeout","context":{}}\n'; exit 1"#,
        );
        let (_, rx) = sup.launch("t", TriggerKind::Manual).unwrap();
        let events = collect(rx).await;

        let failed_count = events
            .iter()
            .filter(|ev| matches!(ev, WorkerEvent::Status(StatusEvent::Failed { .. })))
            .count();
        assert_eq!(failed_count, 1);
    }

    #[tokio::test]
    async fn clean_exit_without_terminal_is_ambiguous() {
        let sup = sh("echo scraping done");
        let (_, rx) = sup.launch("t", TriggerKind::Cron).unwrap();
        let events = collect(rx).await;

        assert!(events.iter().any(|ev| matches!(
            ev,
            WorkerEvent::Log {
                stream: OutputStream::Stdout,
                line
            } if line == "scraping done"
        )));
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Exited {
                exit_code: Some(0),
                ambiguous: true
            })
        ));
        assert!(
            !events
                .iter()
                .any(|ev| matches!(ev, WorkerEvent::Status(_)))
        );
    }

    #[tokio::test]
    async fn stderr_markers_are_logs_not_events() {
        let sup = sh(
            r#"printf '[TASK_STATUS:COMPLETED]{"taskName":"t"}\n' 1>&2; printf '[TASK_STATUS:COMPLETED]{"taskName":"t"}\n'"#,
        );
        let (_, rx) = sup.launch("t", TriggerKind::Manual).unwrap();
        let events = collect(rx).await;

        assert!(events.iter().any(|ev| matches!(
            ev,
            WorkerEvent::Log {
                stream: OutputStream::Stderr,
                ..
            }
        )));
        let status_count = events
            .iter()
            .filter(|ev| matches!(ev, WorkerEvent::Status(_)))
            .count();
        assert_eq!(status_count, 1);
    }

    #[tokio::test]
    async fn malformed_marker_surfaces_as_parse_error() {
        let sup = sh(r#"printf '[TASK_STATUS:STARTED]{broken\n'"#);
        let (_, rx) = sup.launch("t", TriggerKind::Manual).unwrap();
        let events = collect(rx).await;

        assert!(events.iter().any(|ev| matches!(
            ev,
            WorkerEvent::Status(StatusEvent::ParseError { .. })
        )));
        // Parse errors are not terminal, so a clean exit is still ambiguous.
        assert!(matches!(
            events.last(),
            Some(WorkerEvent::Exited {
                ambiguous: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_supervisor_error() {
        let sup = WorkerSupervisor::new(vec!["/nonexistent/webpilot-worker".to_string()]);
        let err = sup.launch("t", TriggerKind::Manual).unwrap_err();
        assert!(matches!(err, SpawnError::Worker { .. }));
    }

    #[test]
    fn trigger_kind_string_forms() {
        for kind in [TriggerKind::Manual, TriggerKind::Cron, TriggerKind::Oneshot] {
            let parsed: TriggerKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("webhook".parse::<TriggerKind>().is_err());
    }
}
