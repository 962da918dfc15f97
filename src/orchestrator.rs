//! Execution orchestration — launching workers and reacting to their
//! status events.
//!
//! `run_now` is fire-and-forget: it validates the task name, starts a
//! worker, and returns its [`RunHandle`] immediately. A spawned consumer
//! task then drives everything downstream — failure recording, the info
//! cache, notifications, run history. Events from one worker are handled
//! in emission order; workers do not wait on each other and nothing caps
//! how many run at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::events::{Notification, Notifier};
use crate::failures::FailureLog;
use crate::info::{InfoCache, InfoResult};
use crate::protocol::StatusEvent;
use crate::store::Database;
use crate::supervisor::{RunHandle, TriggerKind, WorkerEvent, WorkerSupervisor};
use crate::tasks::TaskCatalog;

/// Terminal outcome of a run, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    CompletedWithData,
    Failed,
    /// Clean exit without any terminal status marker.
    Ambiguous,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CompletedWithData => "completed_with_data",
            RunOutcome::Failed => "failed",
            RunOutcome::Ambiguous => "ambiguous",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunOutcome::Completed),
            "completed_with_data" => Ok(RunOutcome::CompletedWithData),
            "failed" => Ok(RunOutcome::Failed),
            "ambiguous" => Ok(RunOutcome::Ambiguous),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// One row of run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_name: String,
    pub trigger: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl TaskRun {
    fn started(handle: &RunHandle) -> Self {
        Self {
            id: handle.run_id,
            task_name: handle.task_name.clone(),
            trigger: handle.trigger,
            started_at: handle.started_at,
            finished_at: None,
            outcome: None,
        }
    }
}

/// Everything a run's consumer task needs, cloned per launch.
#[derive(Clone)]
struct RunContext {
    handle: RunHandle,
    display_name: String,
    db: Arc<dyn Database>,
    notifier: Notifier,
    failures: FailureLog,
    info: InfoCache,
    running: Arc<AtomicUsize>,
    run_finished_tx: mpsc::UnboundedSender<RunHandle>,
}

/// The runtime hub: validates launches, owns the store facades, and fans
/// worker events out to them.
pub struct Orchestrator {
    db: Arc<dyn Database>,
    supervisor: WorkerSupervisor,
    notifier: Notifier,
    catalog: TaskCatalog,
    failures: FailureLog,
    info: InfoCache,
    running: Arc<AtomicUsize>,
    run_finished_tx: mpsc::UnboundedSender<RunHandle>,
}

impl Orchestrator {
    /// `run_finished_tx` receives each run's handle once its worker has
    /// exited and all of its events are processed. The scheduler listens
    /// on the other end to re-evaluate the sleep guard.
    pub fn new(
        db: Arc<dyn Database>,
        supervisor: WorkerSupervisor,
        notifier: Notifier,
        run_finished_tx: mpsc::UnboundedSender<RunHandle>,
    ) -> Self {
        Self {
            catalog: TaskCatalog::new(db.clone()),
            failures: FailureLog::new(db.clone()),
            info: InfoCache::new(db.clone()),
            db,
            supervisor,
            notifier,
            running: Arc::new(AtomicUsize::new(0)),
            run_finished_tx,
        }
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub fn info(&self) -> &InfoCache {
        &self.info
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Number of workers currently in flight.
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most recent runs, newest first.
    pub async fn recent_runs(&self, limit: u32) -> std::result::Result<Vec<TaskRun>, DatabaseError> {
        self.db.list_recent_runs(limit).await
    }

    /// Validate `task_name` against the catalog and launch a worker for it.
    ///
    /// Unknown or disabled names surface to the caller; a spawn error does
    /// too, but leaves no trace against the task itself. On success the
    /// handle comes back immediately and the run proceeds on its own.
    pub async fn run_now(&self, task_name: &str, trigger: TriggerKind) -> Result<RunHandle> {
        let task = self.catalog.resolve(task_name).await?;
        let (handle, rx) = self.supervisor.launch(task_name, trigger)?;

        // History is observability; a write failure must not stop the run.
        if let Err(e) = self.db.insert_run(&TaskRun::started(&handle)).await {
            warn!(run_id = %handle.run_id, error = %e, "Failed to record run start");
        }

        self.running.fetch_add(1, Ordering::SeqCst);
        let ctx = RunContext {
            handle: handle.clone(),
            display_name: task.display_name,
            db: self.db.clone(),
            notifier: self.notifier.clone(),
            failures: self.failures.clone(),
            info: self.info.clone(),
            running: self.running.clone(),
            run_finished_tx: self.run_finished_tx.clone(),
        };
        tokio::spawn(consume_events(ctx, rx));

        Ok(handle)
    }
}

/// Drive one worker's event stream to completion.
async fn consume_events(ctx: RunContext, mut rx: mpsc::Receiver<WorkerEvent>) {
    // Provisional until a terminal marker (or synthesis) decides otherwise.
    let mut outcome = RunOutcome::Ambiguous;

    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::Status(status) => {
                handle_status(&ctx, status, &mut outcome).await;
            }
            WorkerEvent::Log { stream, line } => {
                debug!(
                    task = %ctx.handle.task_name,
                    run_id = %ctx.handle.run_id,
                    stream = ?stream,
                    "{line}"
                );
                ctx.notifier.publish(Notification::WorkerLog {
                    run_id: ctx.handle.run_id,
                    task_name: ctx.handle.task_name.clone(),
                    stream,
                    line,
                });
            }
            WorkerEvent::Exited { exit_code, ambiguous } => {
                if ambiguous {
                    info!(
                        task = %ctx.handle.task_name,
                        run_id = %ctx.handle.run_id,
                        "Run ended without a terminal marker; treating as ambiguous success"
                    );
                }
                info!(
                    task = %ctx.handle.task_name,
                    run_id = %ctx.handle.run_id,
                    exit_code = ?exit_code,
                    outcome = %outcome,
                    "Worker exited"
                );
                if let Err(e) = ctx.db.finish_run(ctx.handle.run_id, Utc::now(), outcome).await {
                    warn!(run_id = %ctx.handle.run_id, error = %e, "Failed to record run finish");
                }
            }
        }
    }

    ctx.running.fetch_sub(1, Ordering::SeqCst);
    let _ = ctx.run_finished_tx.send(ctx.handle.clone());
}

/// Apply one decoded status event to stores and observers.
async fn handle_status(ctx: &RunContext, status: StatusEvent, outcome: &mut RunOutcome) {
    match status {
        StatusEvent::Started { .. } => {
            ctx.notifier.publish(Notification::TaskStarted {
                run: ctx.handle.clone(),
            });
        }
        StatusEvent::Completed { duration_ms, .. } => {
            *outcome = RunOutcome::Completed;
            ctx.notifier.publish(Notification::TaskCompleted {
                run: ctx.handle.clone(),
                duration_ms,
            });
        }
        StatusEvent::CompletedWithData { data, metadata, .. } => {
            *outcome = RunOutcome::CompletedWithData;
            let result = InfoResult::from_event(
                &ctx.handle.task_name,
                data,
                metadata,
                &ctx.display_name,
            );
            match ctx.info.upsert(&result).await {
                Ok(()) => {
                    ctx.notifier.publish(Notification::InfoDataUpdated { result });
                }
                Err(e) => {
                    warn!(
                        task = %ctx.handle.task_name,
                        error = %e,
                        "Failed to store info result"
                    );
                }
            }
        }
        StatusEvent::Failed {
            error_type,
            context,
            ..
        } => {
            *outcome = RunOutcome::Failed;
            match ctx
                .failures
                .record(&ctx.handle.task_name, error_type, context)
                .await
            {
                // Only a genuinely new record notifies; dedup bumps stay quiet.
                Ok((record, true)) => {
                    ctx.notifier.publish(Notification::FailureRecorded { record });
                }
                Ok((_, false)) => {}
                Err(e) => {
                    warn!(
                        task = %ctx.handle.task_name,
                        error = %e,
                        "Failed to persist failure record"
                    );
                }
            }
        }
        StatusEvent::ParseError {
            status,
            raw,
            message,
        } => {
            warn!(
                task = %ctx.handle.task_name,
                run_id = %ctx.handle.run_id,
                status = %status,
                "Malformed status marker: {message}"
            );
            ctx.notifier.publish(Notification::ParseError {
                run_id: ctx.handle.run_id,
                task_name: ctx.handle.task_name.clone(),
                status,
                message,
                raw,
            });
        }
    }
}
