//! Info-gathering cache — the latest data payload per task, with optional
//! expiration.
//!
//! One record per task name; a new completion overwrites unconditionally.
//! Expiration is lazy: expired records stay retrievable, flagged stale on
//! read. There is no background sweep — storage grows until an explicit
//! clear.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::protocol::DataMetadata;
use crate::store::Database;

/// Presentation metadata carried alongside a cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMetadata {
    pub data_type: String,
    pub rendered_by: Option<String>,
}

/// The cached result of one info-gathering task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResult {
    pub task_name: String,
    pub category: String,
    pub display_name: String,
    pub data: Value,
    pub last_updated: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: InfoMetadata,
}

impl InfoResult {
    /// Build a cache record from a `COMPLETED_WITH_DATA` payload.
    /// `display_name` comes from the task catalog, not the worker.
    pub fn from_event(
        task_name: &str,
        data: Value,
        metadata: DataMetadata,
        display_name: &str,
    ) -> Self {
        let now = Utc::now();
        // Worker-supplied TTLs can be arbitrary u64s; total arithmetic
        // only. A TTL too large to represent means no expiry.
        let expires_at = metadata.ttl_seconds.and_then(|secs| {
            let expiry = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|ttl| now.checked_add_signed(ttl));
            if expiry.is_none() {
                warn!(task = %task_name, ttl_seconds = secs, "TTL out of range; caching without expiry");
            }
            expiry
        });
        Self {
            task_name: task_name.to_string(),
            category: metadata.category,
            display_name: display_name.to_string(),
            data,
            last_updated: now,
            expires_at,
            metadata: InfoMetadata {
                data_type: metadata.data_type,
                rendered_by: metadata.rendered_by,
            },
        }
    }

    /// True iff a TTL was set and has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Cache facade over the repository.
#[derive(Clone)]
pub struct InfoCache {
    db: Arc<dyn Database>,
}

impl InfoCache {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Unconditional overwrite of the entry for `result.task_name`.
    pub async fn upsert(&self, result: &InfoResult) -> Result<(), DatabaseError> {
        self.db.upsert_info_result(result).await?;
        info!(
            task = %result.task_name,
            category = %result.category,
            expires = ?result.expires_at,
            "Info-gathering result cached"
        );
        Ok(())
    }

    /// All cached results with their staleness flag as of `now`.
    pub async fn list(&self, now: DateTime<Utc>) -> Result<Vec<(InfoResult, bool)>, DatabaseError> {
        let results = self.db.list_info_results().await?;
        Ok(results
            .into_iter()
            .map(|r| {
                let stale = r.is_expired(now);
                (r, stale)
            })
            .collect())
    }

    pub async fn get(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(InfoResult, bool)>, DatabaseError> {
        Ok(self.db.get_info_result(task_name).await?.map(|r| {
            let stale = r.is_expired(now);
            (r, stale)
        }))
    }

    pub async fn remove(&self, task_name: &str) -> Result<bool, DatabaseError> {
        let removed = self.db.remove_info_result(task_name).await?;
        if removed {
            info!(task = %task_name, "Info-gathering result removed");
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<u64, DatabaseError> {
        let cleared = self.db.clear_info_results().await?;
        info!(count = cleared, "Info-gathering cache cleared");
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    fn metadata(ttl: Option<u64>) -> DataMetadata {
        DataMetadata {
            category: "shopping".to_string(),
            data_type: "price".to_string(),
            ttl_seconds: ttl,
            rendered_by: None,
        }
    }

    async fn cache() -> InfoCache {
        let db = LibSqlBackend::new_memory().await.unwrap();
        InfoCache::new(Arc::new(db))
    }

    #[test]
    fn ttl_sets_expiry() {
        let r = InfoResult::from_event("t", json!(1), metadata(Some(60)), "T");
        let expires = r.expires_at.unwrap();
        assert!(expires > r.last_updated);
        assert!(!r.is_expired(Utc::now()));
        assert!(r.is_expired(expires + Duration::seconds(1)));
    }

    #[test]
    fn no_ttl_never_expires() {
        let r = InfoResult::from_event("t", json!(1), metadata(None), "T");
        assert!(r.expires_at.is_none());
        assert!(!r.is_expired(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn oversized_ttl_caches_without_expiry() {
        // Past chrono's representable range; must not panic.
        let r = InfoResult::from_event("t", json!(1), metadata(Some(10_000_000_000_000)), "T");
        assert!(r.expires_at.is_none());
        assert!(!r.is_expired(Utc::now()));
    }

    #[test]
    fn ttl_beyond_i64_does_not_expire_immediately() {
        // Would wrap negative under a lossy cast and arrive pre-expired.
        let r = InfoResult::from_event("t", json!(1), metadata(Some(u64::MAX)), "T");
        assert!(r.expires_at.is_none());
        assert!(!r.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn upsert_overwrites_single_entry() {
        let cache = cache().await;
        let first = InfoResult::from_event("price-watch", json!({"price": 10}), metadata(None), "Price Watch");
        cache.upsert(&first).await.unwrap();

        let second = InfoResult::from_event("price-watch", json!({"price": 12}), metadata(Some(60)), "Price Watch");
        cache.upsert(&second).await.unwrap();

        let all = cache.list(Utc::now()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0.data["price"], 12);
        assert!(all[0].0.expires_at.is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_flagged_stale_but_retrievable() {
        let cache = cache().await;
        let mut r = InfoResult::from_event("old", json!("x"), metadata(Some(1)), "Old");
        r.expires_at = Some(Utc::now() - Duration::minutes(5));
        cache.upsert(&r).await.unwrap();

        let (got, stale) = cache.get("old", Utc::now()).await.unwrap().unwrap();
        assert!(stale);
        assert_eq!(got.data, json!("x"));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let cache = cache().await;
        cache
            .upsert(&InfoResult::from_event("a", json!(1), metadata(None), "A"))
            .await
            .unwrap();
        cache
            .upsert(&InfoResult::from_event("b", json!(2), metadata(None), "B"))
            .await
            .unwrap();

        assert!(cache.remove("a").await.unwrap());
        assert!(!cache.remove("a").await.unwrap());
        assert_eq!(cache.clear_all().await.unwrap(), 1);
        assert!(cache.list(Utc::now()).await.unwrap().is_empty());
    }
}
