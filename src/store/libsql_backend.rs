//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All writes use RFC 3339
//! timestamps so rows stay readable with plain sqlite tooling.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::failures::FailureRecord;
use crate::info::{InfoMetadata, InfoResult};
use crate::orchestrator::{RunOutcome, TaskRun};
use crate::scheduler::ScheduleEntry;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::supervisor::TriggerKind;
use crate::tasks::TaskDef;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to open libSQL database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a TaskDef.
///
/// Column order matches TASK_COLUMNS:
/// 0:name, 1:display_name, 2:category, 3:description, 4:enabled, 5:created_at, 6:updated_at
fn row_to_task(row: &libsql::Row) -> Result<TaskDef, libsql::Error> {
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;

    Ok(TaskDef {
        name: row.get(0)?,
        display_name: row.get(1)?,
        category: row.get(2)?,
        description: row.get(3).ok(),
        enabled: row.get::<i64>(4)? != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a ScheduleEntry.
///
/// Column order matches SCHEDULE_COLUMNS:
/// 0:id, 1:task, 2:cron, 3:execute_at, 4:created_at
fn row_to_entry(row: &libsql::Row) -> Result<ScheduleEntry, libsql::Error> {
    let id_str: String = row.get(0)?;
    let created_str: String = row.get(4)?;

    Ok(ScheduleEntry {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task: row.get(1)?,
        cron: row.get(2).ok(),
        execute_at: row.get(3).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a FailureRecord.
///
/// Column order matches FAILURE_COLUMNS:
/// 0:id, 1:task_name, 2:error_type, 3:fingerprint, 4:context,
/// 5:timestamp, 6:last_seen, 7:count, 8:dismissed
fn row_to_failure(row: &libsql::Row) -> Result<FailureRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let error_type_str: String = row.get(2)?;
    let context_str: String = row.get(4)?;
    let timestamp_str: String = row.get(5)?;
    let last_seen_str: String = row.get(6)?;

    Ok(FailureRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_name: row.get(1)?,
        error_type: error_type_str.parse().unwrap_or_default(),
        fingerprint: row.get(3)?,
        context: serde_json::from_str(&context_str).unwrap_or_default(),
        timestamp: parse_datetime(&timestamp_str),
        last_seen: parse_datetime(&last_seen_str),
        count: row.get::<i64>(7)? as u32,
        dismissed: row.get::<i64>(8)? != 0,
    })
}

/// Map a libsql Row to an InfoResult.
///
/// Column order matches INFO_COLUMNS:
/// 0:task_name, 1:category, 2:display_name, 3:data, 4:data_type,
/// 5:rendered_by, 6:last_updated, 7:expires_at
fn row_to_info(row: &libsql::Row) -> Result<InfoResult, libsql::Error> {
    let data_str: String = row.get(3)?;
    let updated_str: String = row.get(6)?;
    let expires_str: Option<String> = row.get(7).ok();

    Ok(InfoResult {
        task_name: row.get(0)?,
        category: row.get(1)?,
        display_name: row.get(2)?,
        data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
        last_updated: parse_datetime(&updated_str),
        expires_at: parse_optional_datetime(&expires_str),
        metadata: InfoMetadata {
            data_type: row.get(4)?,
            rendered_by: row.get(5).ok(),
        },
    })
}

/// Map a libsql Row to a TaskRun.
///
/// Column order matches RUN_COLUMNS:
/// 0:id, 1:task_name, 2:trigger_kind, 3:started_at, 4:finished_at, 5:outcome
fn row_to_run(row: &libsql::Row) -> Result<TaskRun, libsql::Error> {
    let id_str: String = row.get(0)?;
    let trigger_str: String = row.get(2)?;
    let started_str: String = row.get(3)?;
    let finished_str: Option<String> = row.get(4).ok();
    let outcome_str: Option<String> = row.get(5).ok();

    Ok(TaskRun {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_name: row.get(1)?,
        trigger: trigger_str.parse().unwrap_or(TriggerKind::Manual),
        started_at: parse_datetime(&started_str),
        finished_at: parse_optional_datetime(&finished_str),
        outcome: outcome_str.and_then(|s| s.parse::<RunOutcome>().ok()),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "name, display_name, category, description, enabled, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, task, cron, execute_at, created_at";

const FAILURE_COLUMNS: &str =
    "id, task_name, error_type, fingerprint, context, timestamp, last_seen, count, dismissed";

const INFO_COLUMNS: &str =
    "task_name, category, display_name, data, data_type, rendered_by, last_updated, expires_at";

const RUN_COLUMNS: &str = "id, task_name, trigger_kind, started_at, finished_at, outcome";

#[async_trait]
impl Database for LibSqlBackend {
    // ── Task catalog ────────────────────────────────────────────────

    async fn list_tasks(&self) -> Result<Vec<TaskDef>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY name ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!("Skipping task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    async fn get_task(&self, name: &str) -> Result<Option<TaskDef>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_task row parse: {e}")))?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn upsert_task(&self, task: &TaskDef) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (name, display_name, category, description, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (name) DO UPDATE SET
                display_name = excluded.display_name,
                category = excluded.category,
                description = excluded.description,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                task.name.clone(),
                task.display_name.clone(),
                task.category.clone(),
                opt_text(task.description.clone()),
                task.enabled as i64,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_task: {e}")))?;

        debug!(task = %task.name, "Task definition upserted");
        Ok(())
    }

    async fn remove_task(&self, name: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM tasks WHERE name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_task: {e}")))?;
        Ok(count > 0)
    }

    // ── Schedule entries ────────────────────────────────────────────

    async fn list_schedule_entries(&self) -> Result<Vec<ScheduleEntry>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedule_entries ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_schedule_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_entry(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Skipping schedule row: {e}");
                }
            }
        }
        Ok(entries)
    }

    async fn add_schedule_entry(&self, entry: &ScheduleEntry) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO schedule_entries (id, task, cron, execute_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id.to_string(),
                entry.task.clone(),
                opt_text(entry.cron.clone()),
                opt_text(entry.execute_at.clone()),
                entry.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_schedule_entry: {e}")))?;

        debug!(entry_id = %entry.id, task = %entry.task, "Schedule entry added");
        Ok(())
    }

    async fn remove_schedule_entry(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM schedule_entries WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_schedule_entry: {e}")))?;
        Ok(count > 0)
    }

    async fn remove_one_shot(&self, task: &str, execute_at: &str) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM schedule_entries WHERE task = ?1 AND execute_at = ?2",
                params![task, execute_at],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_one_shot: {e}")))?;

        if count > 0 {
            debug!(task, execute_at, count, "One-shot schedule entry removed");
        }
        Ok(count)
    }

    // ── Failure records ─────────────────────────────────────────────

    async fn list_failures(
        &self,
        include_dismissed: bool,
    ) -> Result<Vec<FailureRecord>, DatabaseError> {
        let conn = self.conn();
        let sql = if include_dismissed {
            format!("SELECT {FAILURE_COLUMNS} FROM failure_records ORDER BY last_seen DESC")
        } else {
            format!(
                "SELECT {FAILURE_COLUMNS} FROM failure_records WHERE dismissed = 0 ORDER BY last_seen DESC"
            )
        };
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_failures: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_failure(&row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping failure row: {e}");
                }
            }
        }
        Ok(records)
    }

    async fn find_open_failure(
        &self,
        task_name: &str,
        error_type: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<FailureRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {FAILURE_COLUMNS} FROM failure_records
                     WHERE task_name = ?1 AND error_type = ?2 AND fingerprint = ?3
                       AND dismissed = 0 AND last_seen >= ?4
                     ORDER BY last_seen DESC LIMIT 1"
                ),
                params![task_name, error_type, fingerprint, since.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_open_failure: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_failure(&row).map_err(|e| {
                    DatabaseError::Query(format!("find_open_failure row parse: {e}"))
                })?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_open_failure: {e}"))),
        }
    }

    async fn insert_failure(&self, record: &FailureRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let context_json = serde_json::to_string(&record.context)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO failure_records (id, task_name, error_type, fingerprint, context, timestamp, last_seen, count, dismissed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.task_name.clone(),
                record.error_type.as_str(),
                record.fingerprint.clone(),
                context_json,
                record.timestamp.to_rfc3339(),
                record.last_seen.to_rfc3339(),
                record.count as i64,
                record.dismissed as i64,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_failure: {e}")))?;

        debug!(record_id = %record.id, task = %record.task_name, "Failure record inserted");
        Ok(())
    }

    async fn increment_failure(
        &self,
        id: Uuid,
        last_seen: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE failure_records SET count = count + 1, last_seen = ?1 WHERE id = ?2",
            params![last_seen.to_rfc3339(), id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("increment_failure: {e}")))?;

        debug!(record_id = %id, "Failure record count bumped");
        Ok(())
    }

    async fn dismiss_failure(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE failure_records SET dismissed = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dismiss_failure: {e}")))?;
        Ok(count > 0)
    }

    async fn clear_failures(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM failure_records", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_failures: {e}")))?;

        if count > 0 {
            info!(count, "Cleared failure records");
        }
        Ok(count)
    }

    // ── Info-gathering results ──────────────────────────────────────

    async fn list_info_results(&self) -> Result<Vec<InfoResult>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {INFO_COLUMNS} FROM info_results ORDER BY last_updated DESC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_info_results: {e}")))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_info(&row) {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!("Skipping info row: {e}");
                }
            }
        }
        Ok(results)
    }

    async fn get_info_result(
        &self,
        task_name: &str,
    ) -> Result<Option<InfoResult>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {INFO_COLUMNS} FROM info_results WHERE task_name = ?1"),
                params![task_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_info_result: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let result = row_to_info(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_info_result row parse: {e}")))?;
                Ok(Some(result))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_info_result: {e}"))),
        }
    }

    async fn upsert_info_result(&self, result: &InfoResult) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let data_json = serde_json::to_string(&result.data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let expires_at = result.expires_at.map(|dt| dt.to_rfc3339());

        conn.execute(
            "INSERT INTO info_results (task_name, category, display_name, data, data_type, rendered_by, last_updated, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (task_name) DO UPDATE SET
                category = excluded.category,
                display_name = excluded.display_name,
                data = excluded.data,
                data_type = excluded.data_type,
                rendered_by = excluded.rendered_by,
                last_updated = excluded.last_updated,
                expires_at = excluded.expires_at",
            params![
                result.task_name.clone(),
                result.category.clone(),
                result.display_name.clone(),
                data_json,
                result.metadata.data_type.clone(),
                opt_text(result.metadata.rendered_by.clone()),
                result.last_updated.to_rfc3339(),
                opt_text(expires_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_info_result: {e}")))?;

        debug!(task = %result.task_name, "Info result upserted");
        Ok(())
    }

    async fn remove_info_result(&self, task_name: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM info_results WHERE task_name = ?1",
                params![task_name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_info_result: {e}")))?;
        Ok(count > 0)
    }

    async fn clear_info_results(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM info_results", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_info_results: {e}")))?;

        if count > 0 {
            info!(count, "Cleared info results");
        }
        Ok(count)
    }

    // ── Run history ─────────────────────────────────────────────────

    async fn insert_run(&self, run: &TaskRun) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_runs (id, task_name, trigger_kind, started_at, finished_at, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id.to_string(),
                run.task_name.clone(),
                run.trigger.to_string(),
                run.started_at.to_rfc3339(),
                opt_text(run.finished_at.map(|dt| dt.to_rfc3339())),
                opt_text(run.outcome.map(|o| o.to_string())),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_run: {e}")))?;

        Ok(())
    }

    async fn finish_run(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE task_runs SET finished_at = ?1, outcome = ?2 WHERE id = ?3",
            params![finished_at.to_rfc3339(), outcome.to_string(), id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("finish_run: {e}")))?;

        Ok(())
    }

    async fn list_recent_runs(&self, limit: u32) -> Result<Vec<TaskRun>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM task_runs ORDER BY started_at DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    tracing::warn!("Skipping run row: {e}");
                }
            }
        }
        Ok(runs)
    }
}
