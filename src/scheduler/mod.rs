//! Task scheduling — cron and one-shot entries driving automatic runs.
//!
//! Each schedulable entry gets its own timer task: cron entries loop over
//! their upcoming fire times, one-shots sleep until their instant (or fire
//! immediately when already past due) and then remove themselves from the
//! persisted schedule by identity. Entries that fail to parse are skipped
//! with a warning and left in place; the schedule is never auto-pruned.
//!
//! While any pending entry exists the sleep guard keeps the host awake.
//! It is re-checked after every schedule change and every completed run,
//! so a fired one-shot holds the guard until its run drains.

pub mod entry;
pub mod guard;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use entry::{EntryKind, ScheduleEntry};
pub use guard::SleepGuard;

use crate::error::{DatabaseError, Result};
use crate::events::{Notification, Notifier};
use crate::orchestrator::Orchestrator;
use crate::store::Database;
use crate::supervisor::{RunHandle, TriggerKind};

/// Owns the timer tasks and the sleep guard.
pub struct Scheduler {
    db: Arc<dyn Database>,
    orchestrator: Arc<Orchestrator>,
    notifier: Notifier,
    guard: SleepGuard,
    /// Live timer task per schedulable entry, keyed by entry id.
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Bumped to wake sleeping timers during reload/stop. Timers ignore
    /// it once their fire sequence has begun.
    timer_cancel: watch::Sender<u64>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        orchestrator: Arc<Orchestrator>,
        notifier: Notifier,
        guard_cmd: Option<Vec<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            orchestrator,
            notifier,
            guard: SleepGuard::new(guard_cmd),
            timers: Mutex::new(HashMap::new()),
            timer_cancel: watch::channel(0).0,
            running: AtomicBool::new(false),
        })
    }

    /// Mark the scheduler running, hook up the run-completion listener, and
    /// build timers from the persisted schedule.
    pub async fn start(self: &Arc<Self>, mut run_finished_rx: mpsc::UnboundedReceiver<RunHandle>) {
        self.running.store(true, Ordering::SeqCst);

        // Guard policy is re-checked after every run completes.
        let scheduler = self.clone();
        tokio::spawn(async move {
            while let Some(handle) = run_finished_rx.recv().await {
                debug!(task = %handle.task_name, run_id = %handle.run_id, "Run finished");
                scheduler.reevaluate_guard().await;
            }
        });

        self.reload().await;
        info!("Scheduler started");
    }

    /// Tear down all timers and rebuild them from the persisted schedule.
    ///
    /// Called on start and after every schedule edit. Sleeping timers are
    /// woken through the cancel channel and then joined, never aborted. A
    /// one-shot that has already begun firing ignores the wake-up and
    /// finishes its launch and removal before the schedule is re-read, so
    /// the rebuilt set cannot fire it a second time.
    pub async fn reload(self: &Arc<Self>) {
        let mut timers = self.timers.lock().await;
        let old: Vec<JoinHandle<()>> = timers.drain().map(|(_, handle)| handle).collect();
        self.timer_cancel.send_modify(|generation| *generation += 1);
        let _ = join_all(old).await;

        let entries = match self.db.list_schedule_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to load schedule");
                Vec::new()
            }
        };

        let mut scheduled = 0usize;
        for entry in entries {
            match entry.kind() {
                Ok(EntryKind::Cron(schedule)) => {
                    let cancel = self.timer_cancel.subscribe();
                    let handle =
                        tokio::spawn(cron_loop(self.clone(), entry.clone(), schedule, cancel));
                    timers.insert(entry.id, handle);
                    scheduled += 1;
                }
                Ok(EntryKind::OneShot(at)) => {
                    let cancel = self.timer_cancel.subscribe();
                    let handle =
                        tokio::spawn(one_shot_timer(self.clone(), entry.clone(), at, cancel));
                    timers.insert(entry.id, handle);
                    scheduled += 1;
                }
                Err(e) => {
                    // Skipped, never removed: the row stays for the
                    // operator to fix.
                    warn!(
                        entry_id = %entry.id,
                        task = %entry.task,
                        error = %e,
                        "Skipping unschedulable entry"
                    );
                }
            }
        }
        drop(timers);
        debug!(scheduled, "Schedule reloaded");

        self.reevaluate_guard().await;
        self.publish_status().await;
    }

    /// Stop all timers and release the sleep guard. Like `reload`, a timer
    /// that is already firing is joined, so its launch and removal land
    /// before the scheduler reports itself stopped.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);

        let mut timers = self.timers.lock().await;
        let old: Vec<JoinHandle<()>> = timers.drain().map(|(_, handle)| handle).collect();
        self.timer_cancel.send_modify(|generation| *generation += 1);
        let _ = join_all(old).await;
        drop(timers);

        self.guard.stop().await;
        self.publish_status().await;
        info!("Scheduler stopped");
    }

    /// The persisted schedule, as stored.
    pub async fn entries(&self) -> std::result::Result<Vec<ScheduleEntry>, DatabaseError> {
        self.db.list_schedule_entries().await
    }

    /// Persist a new entry and rebuild timers. The trigger is validated
    /// here so an unusable entry is rejected instead of stored.
    pub async fn add_entry(self: &Arc<Self>, entry: ScheduleEntry) -> Result<ScheduleEntry> {
        entry.kind()?;
        self.db.add_schedule_entry(&entry).await?;
        self.reload().await;
        Ok(entry)
    }

    /// Remove an entry by id and rebuild timers. Returns false for an
    /// unknown id.
    pub async fn remove_entry(self: &Arc<Self>, id: Uuid) -> Result<bool> {
        let removed = self.db.remove_schedule_entry(id).await?;
        if removed {
            self.reload().await;
        }
        Ok(removed)
    }

    /// Number of persisted entries that can still fire.
    pub async fn pending_entries(&self) -> usize {
        match self.db.list_schedule_entries().await {
            Ok(entries) => entries.iter().filter(|e| e.is_pending()).count(),
            Err(e) => {
                warn!(error = %e, "Failed to count pending entries");
                0
            }
        }
    }

    /// Current state snapshot, as published to observers.
    pub async fn status(&self) -> Notification {
        Notification::SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            pending_entries: self.pending_entries().await,
            guard_active: self.guard.is_running().await,
        }
    }

    /// Start or stop the sleep guard to match the pending workload.
    /// Best effort; publishes a status event when the guard flips.
    pub async fn reevaluate_guard(&self) {
        let was_active = self.guard.is_running().await;
        let pending = self.pending_entries().await;

        if pending > 0 && self.running.load(Ordering::SeqCst) {
            self.guard.start().await;
        } else {
            self.guard.stop().await;
        }

        let active = self.guard.is_running().await;
        if was_active != active {
            debug!(pending, active, "Sleep guard state changed");
            self.publish_status().await;
        }
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        self.notifier.publish(status);
    }

    /// Launch a scheduled run. Launch errors (unknown task, spawn failure)
    /// are logged here and never unwind the timer.
    async fn fire(&self, task: &str, trigger: TriggerKind) {
        info!(task, trigger = %trigger, "Schedule fired");
        if let Err(e) = self.orchestrator.run_now(task, trigger).await {
            warn!(task, error = %e, "Scheduled run failed to launch");
            // No run will reach the completion listener, so the guard is
            // re-checked here.
            self.reevaluate_guard().await;
        }
    }
}

/// Timer task for a recurring entry: sleep until each upcoming fire time.
/// A wake-up on the cancel channel ends the loop between fires.
async fn cron_loop(
    scheduler: Arc<Scheduler>,
    entry: ScheduleEntry,
    schedule: Schedule,
    mut cancel: watch::Receiver<u64>,
) {
    loop {
        let now = Utc::now();
        let Some(next) = entry::next_fire(&schedule, now) else {
            warn!(task = %entry.task, "Cron schedule has no future firings; timer ending");
            break;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                scheduler.fire(&entry.task, TriggerKind::Cron).await;
            }
            _ = cancel.changed() => break,
        }
    }
}

/// Timer task for a one-shot entry: fire once (immediately when past due),
/// then remove the entry from the persisted schedule by identity.
///
/// The cancel channel is honored only during the sleep. Past that point
/// the fire-and-remove sequence runs to completion, and `reload` joins it
/// before re-reading the schedule; the rebuilt timer set can never see
/// this entry again.
async fn one_shot_timer(
    scheduler: Arc<Scheduler>,
    entry: ScheduleEntry,
    at: DateTime<Utc>,
    mut cancel: watch::Receiver<u64>,
) {
    let now = Utc::now();
    if at > now {
        let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => return,
        }
    } else {
        info!(task = %entry.task, execute_at = %at, "One-shot entry past due; firing now");
    }

    scheduler.fire(&entry.task, TriggerKind::Oneshot).await;

    // Identity-based removal against the current persisted list: only rows
    // still matching (task, execute_at) go; concurrently added entries for
    // the same task survive.
    if let Some(raw) = &entry.execute_at {
        if let Err(e) = scheduler.db.remove_one_shot(&entry.task, raw).await {
            warn!(task = %entry.task, error = %e, "Failed to remove fired one-shot");
        }
    }

    // The guard is left alone: it holds until the launched run completes
    // and the run-completion listener re-checks it.
    scheduler.publish_status().await;
}
