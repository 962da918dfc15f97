//! Unified `Database` trait — single async interface for all persistence.
//!
//! The scheduler and orchestrator only ever see this trait, so the storage
//! medium is swappable without touching their logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::failures::FailureRecord;
use crate::info::InfoResult;
use crate::orchestrator::{RunOutcome, TaskRun};
use crate::scheduler::ScheduleEntry;
use crate::tasks::TaskDef;

/// Backend-agnostic database trait covering the task catalog, schedule
/// entries, failure records, info-gathering results, and run history.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Task catalog ────────────────────────────────────────────────

    /// All task definitions, ordered by name.
    async fn list_tasks(&self) -> Result<Vec<TaskDef>, DatabaseError>;

    /// Look up one task by name.
    async fn get_task(&self, name: &str) -> Result<Option<TaskDef>, DatabaseError>;

    /// Insert or replace a task definition.
    async fn upsert_task(&self, task: &TaskDef) -> Result<(), DatabaseError>;

    /// Remove a task definition. Returns false if the name was unknown.
    async fn remove_task(&self, name: &str) -> Result<bool, DatabaseError>;

    // ── Schedule entries ────────────────────────────────────────────

    /// The persisted schedule, in insertion order.
    async fn list_schedule_entries(&self) -> Result<Vec<ScheduleEntry>, DatabaseError>;

    /// Append an entry to the persisted schedule.
    async fn add_schedule_entry(&self, entry: &ScheduleEntry) -> Result<(), DatabaseError>;

    /// Remove an entry by id. Returns false if the id was unknown.
    async fn remove_schedule_entry(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Identity-based one-shot removal: delete every entry matching exactly
    /// `(task, execute_at)`, against the current persisted state. Concurrent
    /// edits to other entries are untouched. Returns the number removed.
    async fn remove_one_shot(&self, task: &str, execute_at: &str)
    -> Result<u64, DatabaseError>;

    // ── Failure records ─────────────────────────────────────────────

    /// Failure records, most recently seen first.
    async fn list_failures(
        &self,
        include_dismissed: bool,
    ) -> Result<Vec<FailureRecord>, DatabaseError>;

    /// Find a non-dismissed record matching the dedup key with `last_seen`
    /// at or after `since`.
    async fn find_open_failure(
        &self,
        task_name: &str,
        error_type: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<FailureRecord>, DatabaseError>;

    /// Insert a new failure record.
    async fn insert_failure(&self, record: &FailureRecord) -> Result<(), DatabaseError>;

    /// Bump an existing record: `count + 1` and a fresh `last_seen`.
    async fn increment_failure(
        &self,
        id: Uuid,
        last_seen: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Mark a record dismissed. Returns false if the id was unknown.
    async fn dismiss_failure(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Delete all failure records. Returns the number deleted.
    async fn clear_failures(&self) -> Result<u64, DatabaseError>;

    // ── Info-gathering results ──────────────────────────────────────

    /// All cached results, most recently updated first.
    async fn list_info_results(&self) -> Result<Vec<InfoResult>, DatabaseError>;

    /// The cached result for one task, if any.
    async fn get_info_result(&self, task_name: &str)
    -> Result<Option<InfoResult>, DatabaseError>;

    /// Insert or replace the result for `result.task_name`.
    async fn upsert_info_result(&self, result: &InfoResult) -> Result<(), DatabaseError>;

    /// Delete the result for one task. Returns false if absent.
    async fn remove_info_result(&self, task_name: &str) -> Result<bool, DatabaseError>;

    /// Delete all cached results. Returns the number deleted.
    async fn clear_info_results(&self) -> Result<u64, DatabaseError>;

    // ── Run history ─────────────────────────────────────────────────

    /// Record a launched run.
    async fn insert_run(&self, run: &TaskRun) -> Result<(), DatabaseError>;

    /// Close out a run with its terminal outcome.
    async fn finish_run(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<(), DatabaseError>;

    /// Most recent runs, newest first.
    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<TaskRun>, DatabaseError>;
}
