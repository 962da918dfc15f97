//! End-to-end tests for the run pipeline and scheduler.
//!
//! Workers are stand-in shell scripts speaking the status protocol on
//! stdout, so every test exercises the real spawn → decode → record path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use webpilot::events::{Notification, Notifier};
use webpilot::failures::{FailureRecord, context_fingerprint};
use webpilot::info::{InfoMetadata, InfoResult};
use webpilot::orchestrator::Orchestrator;
use webpilot::protocol::ErrorType;
use webpilot::scheduler::{ScheduleEntry, Scheduler};
use webpilot::store::{Database, LibSqlBackend};
use webpilot::supervisor::{RunHandle, TriggerKind, WorkerSupervisor};
use webpilot::tasks::TaskDef;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const COMPLETING_WORKER: &str = r#"printf '[TASK_STATUS:STARTED]{"taskName":"t"}\n[TASK_STATUS:COMPLETED]{"taskName":"t","durationMs":8}\n'"#;

const FAILING_WORKER: &str = r#"printf '[TASK_STATUS:STARTED]{"taskName":"t"}\n[TASK_STATUS:FAILED]{"taskName":"t","errorType":"timeout","context":{"url":"https://example.com/a"}}\n'"#;

const DATA_WORKER: &str = r#"printf '[TASK_STATUS:STARTED]{"taskName":"t"}\n[TASK_STATUS:COMPLETED_WITH_DATA]{"taskName":"t","data":{"price":42},"metadata":{"category":"shopping","dataType":"price","ttlSeconds":3600}}\n'"#;

/// Worker that stays in flight long enough for the run window to be
/// observed from outside.
const SLOW_COMPLETING_WORKER: &str = r#"printf '[TASK_STATUS:STARTED]{"taskName":"t"}\n'; sleep 1; printf '[TASK_STATUS:COMPLETED]{"taskName":"t","durationMs":1000}\n'"#;

struct Harness {
    db: Arc<dyn Database>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    notifier: Notifier,
    run_finished_rx: mpsc::UnboundedReceiver<RunHandle>,
}

/// Build a full daemon core around a shell-script worker. The sleep guard
/// runs a plain `sleep` so guard behavior is observable on any platform.
async fn harness(script: &str) -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let notifier = Notifier::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        WorkerSupervisor::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]),
        notifier.clone(),
        tx,
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&db),
        Arc::clone(&orchestrator),
        notifier.clone(),
        Some(vec!["sleep".to_string(), "300".to_string()]),
    );
    Harness {
        db,
        orchestrator,
        scheduler,
        notifier,
        run_finished_rx: rx,
    }
}

async fn seed_task(h: &Harness, name: &str) {
    h.orchestrator
        .catalog()
        .upsert(&TaskDef::new(name, "Test task", "general"))
        .await
        .unwrap();
}

/// Wait for the next notification of the given kind, skipping others.
async fn await_event(
    rx: &mut tokio::sync::broadcast::Receiver<Notification>,
    kind: &str,
) -> Notification {
    loop {
        let event = rx.recv().await.unwrap();
        if event.kind() == kind {
            return event;
        }
    }
}

// ── Failure dedup across the window boundary ────────────────────────────

#[tokio::test]
async fn failure_outside_dedup_window_creates_a_fresh_record() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(FAILING_WORKER).await;
        seed_task(&h, "t").await;

        // An old record with the same identity, last seen 30h ago — outside
        // the 24h window, so the next occurrence must not collapse into it.
        let mut context = serde_json::Map::new();
        context.insert("url".to_string(), json!("https://example.com/a"));
        let old_seen = Utc::now() - chrono::Duration::hours(30);
        h.db.insert_failure(&FailureRecord {
            id: Uuid::new_v4(),
            task_name: "t".to_string(),
            error_type: ErrorType::Timeout,
            context: context.clone(),
            fingerprint: context_fingerprint(&context),
            timestamp: old_seen,
            last_seen: old_seen,
            count: 4,
            dismissed: false,
        })
        .await
        .unwrap();

        let mut events = h.notifier.subscribe();
        h.orchestrator
            .run_now("t", TriggerKind::Manual)
            .await
            .unwrap();

        // A fresh record notifies; a dedup bump would not.
        await_event(&mut events, "failure-recorded").await;

        let records = h.orchestrator.failures().list().await.unwrap();
        assert_eq!(records.len(), 2);
        // Most recently seen first.
        assert_eq!(records[0].count, 1);
        assert_eq!(records[1].count, 4);
        assert_eq!(records[0].fingerprint, records[1].fingerprint);
    })
    .await
    .expect("test timed out");
}

// ── Scheduler end-to-end ────────────────────────────────────────────────

#[tokio::test]
async fn recurring_entry_fires_and_is_not_removed() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(COMPLETING_WORKER).await;
        seed_task(&h, "t").await;

        let mut events = h.notifier.subscribe();
        h.scheduler.start(h.run_finished_rx).await;
        h.scheduler
            .add_entry(ScheduleEntry::recurring("t", "* * * * * *"))
            .await
            .unwrap();

        await_event(&mut events, "task-started").await;
        await_event(&mut events, "task-completed").await;

        // Recurring entries stay on the schedule after firing.
        let entries = h.scheduler.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cron.as_deref(), Some("* * * * * *"));

        let runs = h.orchestrator.recent_runs(10).await.unwrap();
        assert!(!runs.is_empty());
        assert_eq!(runs[0].trigger, TriggerKind::Cron);

        h.scheduler.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mixed_schedule_skips_invalid_and_removes_fired_one_shot() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(COMPLETING_WORKER).await;
        seed_task(&h, "t").await;

        // Inserted directly: add_entry would reject the broken cron.
        h.db.add_schedule_entry(&ScheduleEntry::recurring("t", "!!!"))
            .await
            .unwrap();
        h.db.add_schedule_entry(&ScheduleEntry::one_shot("t", "2020-01-01T00:00:00Z"))
            .await
            .unwrap();

        let mut events = h.notifier.subscribe();
        h.scheduler.start(h.run_finished_rx).await;

        // The past-due one-shot fires immediately on startup.
        await_event(&mut events, "task-started").await;

        // It then removes itself; the unparseable entry is left untouched.
        let mut entries = Vec::new();
        for _ in 0..40 {
            entries = h.scheduler.entries().await.unwrap();
            if entries.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cron.as_deref(), Some("!!!"));

        h.scheduler.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stop_releases_guard_and_reports_status() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(COMPLETING_WORKER).await;
        seed_task(&h, "t").await;

        h.scheduler.start(h.run_finished_rx).await;
        h.scheduler
            .add_entry(ScheduleEntry::one_shot("t", "2030-01-01T09:00:00Z"))
            .await
            .unwrap();

        match h.scheduler.status().await {
            Notification::SchedulerStatus {
                running,
                pending_entries,
                guard_active,
            } => {
                assert!(running);
                assert_eq!(pending_entries, 1);
                assert!(guard_active, "a pending entry keeps the host awake");
            }
            other => panic!("unexpected status {other:?}"),
        }

        h.scheduler.stop().await;
        match h.scheduler.status().await {
            Notification::SchedulerStatus {
                running,
                guard_active,
                ..
            } => {
                assert!(!running);
                assert!(!guard_active, "stop must release the guard");
            }
            other => panic!("unexpected status {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn guard_holds_through_a_fired_run_and_stops_on_completion() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(SLOW_COMPLETING_WORKER).await;
        seed_task(&h, "t").await;

        let mut events = h.notifier.subscribe();
        h.scheduler.start(h.run_finished_rx).await;

        let fire_at = (Utc::now() + chrono::Duration::milliseconds(500)).to_rfc3339();
        h.scheduler
            .add_entry(ScheduleEntry::one_shot("t", fire_at))
            .await
            .unwrap();

        match h.scheduler.status().await {
            Notification::SchedulerStatus {
                pending_entries,
                guard_active,
                ..
            } => {
                assert_eq!(pending_entries, 1);
                assert!(guard_active, "a pending one-shot keeps the host awake");
            }
            other => panic!("unexpected status {other:?}"),
        }

        // The entry fires and is consumed, but its run is still in flight:
        // the guard holds until the run drains.
        await_event(&mut events, "task-started").await;
        match h.scheduler.status().await {
            Notification::SchedulerStatus { guard_active, .. } => {
                assert!(guard_active, "guard must hold while the fired run is in flight");
            }
            other => panic!("unexpected status {other:?}"),
        }

        await_event(&mut events, "task-completed").await;

        // Release comes through the run-completion listener, with no
        // schedule edit in between.
        let mut released = false;
        for _ in 0..40 {
            if let Notification::SchedulerStatus {
                running: true,
                pending_entries: 0,
                guard_active: false,
            } = h.scheduler.status().await
            {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(released, "the guard must stop once the run completes with nothing pending");

        h.scheduler.stop().await;
    })
    .await
    .expect("test timed out");
}

// ── Info cache through the engine ───────────────────────────────────────

#[tokio::test]
async fn data_runs_keep_one_row_per_task_and_flag_stale_rows() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(DATA_WORKER).await;
        seed_task(&h, "t").await;

        let mut events = h.notifier.subscribe();
        for _ in 0..2 {
            h.orchestrator
                .run_now("t", TriggerKind::Manual)
                .await
                .unwrap();
            await_event(&mut events, "info-data-updated").await;
        }

        // Two completions, one row: the second overwrote the first.
        let now = Utc::now();
        let rows = h.orchestrator.info().list(now).await.unwrap();
        assert_eq!(rows.len(), 1);
        let (row, stale) = &rows[0];
        assert_eq!(row.data["price"], 42);
        assert!(!stale);

        // An expired row is still listed, flagged stale on read.
        h.db.upsert_info_result(&InfoResult {
            task_name: "old-task".to_string(),
            category: "misc".to_string(),
            display_name: "Old".to_string(),
            data: json!("x"),
            last_updated: now - chrono::Duration::hours(2),
            expires_at: Some(now - chrono::Duration::hours(1)),
            metadata: InfoMetadata {
                data_type: "text".to_string(),
                rendered_by: None,
            },
        })
        .await
        .unwrap();

        let rows = h.orchestrator.info().list(Utc::now()).await.unwrap();
        assert_eq!(rows.len(), 2);
        let stale_row = rows.iter().find(|(r, _)| r.task_name == "old-task").unwrap();
        assert!(stale_row.1, "expired rows are flagged, not hidden");
    })
    .await
    .expect("test timed out");
}

// ── Persistence across restarts ─────────────────────────────────────────

#[tokio::test]
async fn schedule_and_catalog_survive_reopen() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("webpilot.db");

        let entry_id;
        {
            let db = LibSqlBackend::new_local(&db_path).await.unwrap();
            db.upsert_task(&TaskDef::new("t", "Test task", "general"))
                .await
                .unwrap();
            let entry = ScheduleEntry::recurring("t", "0 0 9 * * *");
            entry_id = entry.id;
            db.add_schedule_entry(&entry).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        let task = db.get_task("t").await.unwrap().unwrap();
        assert_eq!(task.display_name, "Test task");
        let entries = db.list_schedule_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry_id);
    })
    .await
    .expect("test timed out");
}
