//! Notification channel — orchestration events fanned out to observers.
//!
//! Every subscriber (WebSocket clients, the scheduler's own bookkeeping,
//! tests) sees the same tagged stream. Payloads are the corresponding domain
//! entities; the wire tag is the event name.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::failures::FailureRecord;
use crate::info::InfoResult;
use crate::supervisor::{OutputStream, RunHandle};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Events published by the orchestration core.
///
/// `WorkerLog` and `ParseError` carry the worker-stream observability
/// required by the status protocol: non-protocol lines are forwarded
/// verbatim, and malformed marker lines surface as parse events rather than
/// task failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    TaskStarted {
        run: RunHandle,
    },
    TaskCompleted {
        run: RunHandle,
        duration_ms: Option<u64>,
    },
    FailureRecorded {
        record: FailureRecord,
    },
    InfoDataUpdated {
        result: InfoResult,
    },
    SchedulerStatus {
        running: bool,
        pending_entries: usize,
        guard_active: bool,
    },
    WorkerLog {
        run_id: Uuid,
        task_name: String,
        stream: OutputStream,
        line: String,
    },
    ParseError {
        run_id: Uuid,
        task_name: String,
        status: String,
        message: String,
        raw: String,
    },
}

impl Notification {
    /// The wire tag, for logging and filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::TaskStarted { .. } => "task-started",
            Notification::TaskCompleted { .. } => "task-completed",
            Notification::FailureRecorded { .. } => "failure-recorded",
            Notification::InfoDataUpdated { .. } => "info-data-updated",
            Notification::SchedulerStatus { .. } => "scheduler-status",
            Notification::WorkerLog { .. } => "worker-log",
            Notification::ParseError { .. } => "parse-error",
        }
    }
}

/// Broadcast fan-out for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to live events. Each observer calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish to all subscribers. Fine if nobody is listening yet.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
