//! Failure records — deduplicated retention of structured task failures.
//!
//! Recurring failures are collapsed by `(task_name, error_type, fingerprint)`
//! within a 24-hour window: a match bumps the existing record's count and
//! `last_seen` instead of creating a new row. Records only ever leave the
//! store through operator dismiss/clear, never automatically.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::protocol::ErrorType;
use crate::store::Database;

/// Window within which matching failures are collapsed into one record.
pub const DEDUP_WINDOW_HOURS: i64 = 24;

/// Context fields that participate in the dedup fingerprint, in canonical
/// order. `exitCode` covers failures synthesized from a worker crash.
const COMPARABLE_FIELDS: &[&str] = &["selector", "url", "exitCode"];

/// One deduplicated failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub task_name: String,
    pub error_type: ErrorType,
    pub context: Map<String, Value>,
    pub fingerprint: String,
    /// First occurrence.
    pub timestamp: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u32,
    pub dismissed: bool,
}

/// Stable fingerprint over the comparable fields of a failure context.
///
/// Only the documented comparable fields are hashed when any of them is
/// present; otherwise the remaining scalar fields are folded in sorted by
/// key. Nested objects and arrays never participate, and JSON key order
/// cannot change the result.
pub fn context_fingerprint(context: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    let mut matched = false;

    for field in COMPARABLE_FIELDS {
        if let Some(value) = context.get(*field).filter(|v| is_scalar(v)) {
            canonical.push_str(field);
            canonical.push('=');
            canonical.push_str(&value.to_string());
            canonical.push('|');
            matched = true;
        }
    }

    if !matched {
        let mut scalars: Vec<(&String, &Value)> =
            context.iter().filter(|(_, v)| is_scalar(v)).collect();
        scalars.sort_by_key(|(k, _)| k.as_str());
        for (key, value) in scalars {
            canonical.push_str(key);
            canonical.push('=');
            canonical.push_str(&value.to_string());
            canonical.push('|');
        }
    }

    format!("{:016x}", content_hash(&canonical))
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn content_hash(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Store facade running the dedup policy on top of the repository.
#[derive(Clone)]
pub struct FailureLog {
    db: Arc<dyn Database>,
}

impl FailureLog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Record a failure, collapsing into an existing record when the same
    /// `(task_name, error_type, fingerprint)` was seen within the dedup
    /// window. Returns the record and whether it was newly created — new
    /// records drive `failure-recorded` notifications, bumps do not.
    pub async fn record(
        &self,
        task_name: &str,
        error_type: ErrorType,
        context: Map<String, Value>,
    ) -> Result<(FailureRecord, bool), DatabaseError> {
        let fingerprint = context_fingerprint(&context);
        let now = Utc::now();
        let since = now - Duration::hours(DEDUP_WINDOW_HOURS);

        if let Some(mut existing) = self
            .db
            .find_open_failure(task_name, error_type.as_str(), &fingerprint, since)
            .await?
        {
            self.db.increment_failure(existing.id, now).await?;
            existing.count += 1;
            existing.last_seen = now;
            debug!(
                task = %task_name,
                error_type = %error_type,
                count = existing.count,
                "Recurring failure deduplicated"
            );
            return Ok((existing, false));
        }

        let record = FailureRecord {
            id: Uuid::new_v4(),
            task_name: task_name.to_string(),
            error_type,
            context,
            fingerprint,
            timestamp: now,
            last_seen: now,
            count: 1,
            dismissed: false,
        };
        self.db.insert_failure(&record).await?;
        info!(
            task = %task_name,
            error_type = %error_type,
            id = %record.id,
            "Failure recorded"
        );
        Ok((record, true))
    }

    /// Non-dismissed records, most recently seen first.
    pub async fn list(&self) -> Result<Vec<FailureRecord>, DatabaseError> {
        self.db.list_failures(false).await
    }

    /// Unconditional operator dismiss. Returns false if the id is unknown.
    pub async fn dismiss(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let dismissed = self.db.dismiss_failure(id).await?;
        if dismissed {
            info!(%id, "Failure dismissed");
        }
        Ok(dismissed)
    }

    /// Unconditional operator clear. Returns the number of records removed.
    pub async fn clear_all(&self) -> Result<u64, DatabaseError> {
        let cleared = self.db.clear_failures().await?;
        info!(count = cleared, "Failure records cleared");
        Ok(cleared)
    }
}
