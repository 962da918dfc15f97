//! Schedule entries — persisted rows describing when a task should run.
//!
//! An entry carries its trigger as raw text (`cron` expression or
//! `execute_at` timestamp) exactly as stored. Parsing happens at
//! classification time so an invalid row can be skipped with a warning
//! instead of being silently dropped or auto-deleted.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;

/// One persisted schedule row.
///
/// Exactly one of `cron` / `execute_at` should be set. Rows violating
/// that, or carrying unparseable trigger text, stay in the schedule but
/// never fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    /// Name of the task to launch when the trigger fires.
    pub task: String,
    /// Recurring trigger in crontab syntax (5 fields, or 6 with seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// One-shot trigger, RFC 3339 timestamp kept verbatim as stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execute_at: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parsed trigger for one entry.
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// Fires repeatedly per the cron schedule.
    Cron(Schedule),
    /// Fires once at the given instant, then the entry is removed.
    OneShot(DateTime<Utc>),
}

impl ScheduleEntry {
    /// New recurring entry.
    pub fn recurring(task: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            cron: Some(cron.into()),
            execute_at: None,
            created_at: Utc::now(),
        }
    }

    /// New one-shot entry.
    pub fn one_shot(task: impl Into<String>, execute_at: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.into(),
            cron: None,
            execute_at: Some(execute_at.into()),
            created_at: Utc::now(),
        }
    }

    /// Classify the entry, parsing its trigger text.
    ///
    /// `cron` wins if both fields are somehow set. Errors mean the row
    /// should be skipped, never removed.
    pub fn kind(&self) -> Result<EntryKind, ScheduleError> {
        if let Some(expr) = &self.cron {
            return Ok(EntryKind::Cron(parse_cron(expr)?));
        }
        if let Some(raw) = &self.execute_at {
            let at = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ScheduleError::InvalidTimestamp { value: raw.clone() })?
                .with_timezone(&Utc);
            return Ok(EntryKind::OneShot(at));
        }
        Err(ScheduleError::MissingTrigger {
            task: self.task.clone(),
        })
    }

    /// Whether this entry still represents future work. Cron entries
    /// always do; a one-shot only while its instant has not passed.
    /// Unparseable rows never do.
    pub fn is_pending(&self) -> bool {
        match self.kind() {
            Ok(EntryKind::Cron(_)) => true,
            Ok(EntryKind::OneShot(at)) => at > Utc::now(),
            Err(_) => false,
        }
    }
}

/// Parse a crontab expression, accepting both the classic 5-field form
/// and the 6/7-field form with leading seconds. 5-field expressions get
/// a `0` seconds column prepended.
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// Next fire time strictly after `now`, if the schedule has one.
pub fn next_fire(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_normalized() {
        let schedule = parse_cron("* * * * *").unwrap();
        assert!(next_fire(&schedule, Utc::now()).is_some());
    }

    #[test]
    fn six_field_cron_parses_directly() {
        let schedule = parse_cron("0 30 9 * * *").unwrap();
        assert!(next_fire(&schedule, Utc::now()).is_some());
    }

    #[test]
    fn invalid_cron_is_an_error() {
        let err = parse_cron("not-a-cron").unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
    }

    #[test]
    fn cron_entry_classifies_as_cron() {
        let entry = ScheduleEntry::recurring("check_flights", "* * * * *");
        assert!(matches!(entry.kind(), Ok(EntryKind::Cron(_))));
        assert!(entry.is_pending());
    }

    #[test]
    fn one_shot_entry_classifies_with_parsed_instant() {
        let entry = ScheduleEntry::one_shot("check_flights", "2030-01-01T09:00:00Z");
        match entry.kind() {
            Ok(EntryKind::OneShot(at)) => {
                assert_eq!(at.to_rfc3339(), "2030-01-01T09:00:00+00:00");
            }
            other => panic!("expected one-shot, got {other:?}"),
        }
    }

    #[test]
    fn past_due_one_shot_is_not_pending() {
        let entry = ScheduleEntry::one_shot("check_flights", "2020-01-01T09:00:00Z");
        // Still classifiable (it will fire late), but no longer future work.
        assert!(entry.kind().is_ok());
        assert!(!entry.is_pending());

        let future = ScheduleEntry::one_shot("check_flights", "2030-01-01T09:00:00Z");
        assert!(future.is_pending());
    }

    #[test]
    fn bad_timestamp_is_an_error_not_a_removal() {
        let entry = ScheduleEntry::one_shot("check_flights", "tomorrow-ish");
        assert!(matches!(
            entry.kind(),
            Err(ScheduleError::InvalidTimestamp { .. })
        ));
        assert!(!entry.is_pending());
        // The raw text survives untouched for later inspection.
        assert_eq!(entry.execute_at.as_deref(), Some("tomorrow-ish"));
    }

    #[test]
    fn entry_without_trigger_is_an_error() {
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            task: "check_flights".into(),
            cron: None,
            execute_at: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            entry.kind(),
            Err(ScheduleError::MissingTrigger { .. })
        ));
    }

    #[test]
    fn cron_wins_when_both_fields_set() {
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            task: "check_flights".into(),
            cron: Some("* * * * *".into()),
            execute_at: Some("2030-01-01T09:00:00Z".into()),
            created_at: Utc::now(),
        };
        assert!(matches!(entry.kind(), Ok(EntryKind::Cron(_))));
    }
}
