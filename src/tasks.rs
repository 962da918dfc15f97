//! Task definitions — the catalog of runnable browser-automation scripts.
//!
//! Workers are opaque: the daemon only knows a task by name. The catalog is
//! what `run_now` validates against before anything is spawned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, Error, TaskError};
use crate::store::Database;

/// A named browser-automation script the daemon can launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub display_name: String,
    pub category: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>, category: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            display_name: display_name.into(),
            category: category.into(),
            description: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Catalog facade over the store. Launch paths resolve task names here;
/// unknown or disabled names are the only errors surfaced synchronously to
/// callers.
#[derive(Clone)]
pub struct TaskCatalog {
    db: Arc<dyn Database>,
}

impl TaskCatalog {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<TaskDef>, DatabaseError> {
        self.db.list_tasks().await
    }

    pub async fn get(&self, name: &str) -> Result<Option<TaskDef>, DatabaseError> {
        self.db.get_task(name).await
    }

    pub async fn upsert(&self, task: &TaskDef) -> Result<(), DatabaseError> {
        self.db.upsert_task(task).await
    }

    pub async fn remove(&self, name: &str) -> Result<bool, DatabaseError> {
        self.db.remove_task(name).await
    }

    /// Resolve a task for launch: it must exist and be enabled.
    pub async fn resolve(&self, name: &str) -> Result<TaskDef, Error> {
        let task = self
            .db
            .get_task(name)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                name: name.to_string(),
            })?;
        if !task.enabled {
            return Err(TaskError::Disabled {
                name: name.to_string(),
            }
            .into());
        }
        Ok(task)
    }
}
