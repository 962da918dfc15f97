//! Status protocol — the line grammar workers use to report task lifecycle
//! events on stdout.
//!
//! A worker writes UTF-8 lines. Lines of the form
//! `[TASK_STATUS:<STATUS>]<json>` are protocol lines, where `<STATUS>` names
//! the event kind and `<json>` is a single-line JSON object with that kind's
//! payload. Every other line is an opaque log line and is forwarded to
//! observers untouched. The grammar lives here and only here; both encoding
//! and decoding go through this module.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker grammar: `[TASK_STATUS:<STATUS>]<json>`, anchored at line start.
static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[TASK_STATUS:([A-Z_]+)\](.*)$").unwrap());

/// Failure classification a worker reports in a `FAILED` payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ElementNotFound,
    NavigationFailure,
    Timeout,
    #[default]
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ElementNotFound => "element_not_found",
            ErrorType::NavigationFailure => "navigation_failure",
            ErrorType::Timeout => "timeout",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "element_not_found" => Ok(ErrorType::ElementNotFound),
            "navigation_failure" => Ok(ErrorType::NavigationFailure),
            "timeout" => Ok(ErrorType::Timeout),
            "unknown" => Ok(ErrorType::Unknown),
            other => Err(format!("unknown error type: {other}")),
        }
    }
}

/// Metadata attached to a `COMPLETED_WITH_DATA` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMetadata {
    pub category: String,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_by: Option<String>,
}

/// One decoded protocol event.
///
/// `ParseError` covers lines that matched the marker prefix but carried an
/// unknown status kind or a payload that failed to decode. Those are
/// observability events, never task failures; decoding itself cannot fail.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Started {
        task_name: String,
    },
    Completed {
        task_name: String,
        duration_ms: Option<u64>,
    },
    CompletedWithData {
        task_name: String,
        data: Value,
        metadata: DataMetadata,
    },
    Failed {
        task_name: String,
        error_type: ErrorType,
        context: serde_json::Map<String, Value>,
    },
    ParseError {
        status: String,
        raw: String,
        message: String,
    },
}

impl StatusEvent {
    /// Task the event refers to, when the payload decoded far enough to know.
    pub fn task_name(&self) -> Option<&str> {
        match self {
            StatusEvent::Started { task_name }
            | StatusEvent::Completed { task_name, .. }
            | StatusEvent::CompletedWithData { task_name, .. }
            | StatusEvent::Failed { task_name, .. } => Some(task_name),
            StatusEvent::ParseError { .. } => None,
        }
    }

    /// True for events that end a run (the worker will not report again).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusEvent::Completed { .. }
                | StatusEvent::CompletedWithData { .. }
                | StatusEvent::Failed { .. }
        )
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::Started { .. } => "STARTED",
            StatusEvent::Completed { .. } => "COMPLETED",
            StatusEvent::CompletedWithData { .. } => "COMPLETED_WITH_DATA",
            StatusEvent::Failed { .. } => "FAILED",
            StatusEvent::ParseError { .. } => "PARSE_ERROR",
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartedPayload {
    task_name: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletedPayload {
    task_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPayload {
    task_name: String,
    data: Value,
    metadata: DataMetadata,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedPayload {
    task_name: String,
    error_type: ErrorType,
    context: serde_json::Map<String, Value>,
}

/// Decode one worker output line.
///
/// Returns `None` for ordinary log lines. A line that matches the marker
/// prefix always yields `Some`: a well-formed payload becomes its event, and
/// anything else (unknown kind, malformed JSON, wrong payload shape) becomes
/// `ParseError`.
pub fn decode_line(line: &str) -> Option<StatusEvent> {
    let trimmed = line.trim_end();
    let caps = MARKER.captures(trimmed)?;
    let kind = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let payload = caps.get(2).map(|m| m.as_str()).unwrap_or_default().trim();

    let parsed = match kind {
        "STARTED" => serde_json::from_str::<StartedPayload>(payload)
            .map(|p| StatusEvent::Started { task_name: p.task_name }),
        "COMPLETED" => serde_json::from_str::<CompletedPayload>(payload).map(|p| {
            StatusEvent::Completed {
                task_name: p.task_name,
                duration_ms: p.duration_ms,
            }
        }),
        "COMPLETED_WITH_DATA" => serde_json::from_str::<DataPayload>(payload).map(|p| {
            StatusEvent::CompletedWithData {
                task_name: p.task_name,
                data: p.data,
                metadata: p.metadata,
            }
        }),
        "FAILED" => serde_json::from_str::<FailedPayload>(payload).map(|p| {
            StatusEvent::Failed {
                task_name: p.task_name,
                error_type: p.error_type,
                context: p.context,
            }
        }),
        other => {
            return Some(StatusEvent::ParseError {
                status: other.to_string(),
                raw: trimmed.to_string(),
                message: format!("unknown status kind {other:?}"),
            });
        }
    };

    Some(parsed.unwrap_or_else(|e| StatusEvent::ParseError {
        status: kind.to_string(),
        raw: trimmed.to_string(),
        message: e.to_string(),
    }))
}

/// Encode an event as one protocol line. `ParseError` has no wire form.
pub fn encode_line(event: &StatusEvent) -> Option<String> {
    let (kind, payload) = match event {
        StatusEvent::Started { task_name } => (
            "STARTED",
            serde_json::to_value(StartedPayload {
                task_name: task_name.clone(),
            }),
        ),
        StatusEvent::Completed {
            task_name,
            duration_ms,
        } => (
            "COMPLETED",
            serde_json::to_value(CompletedPayload {
                task_name: task_name.clone(),
                duration_ms: *duration_ms,
            }),
        ),
        StatusEvent::CompletedWithData {
            task_name,
            data,
            metadata,
        } => (
            "COMPLETED_WITH_DATA",
            serde_json::to_value(DataPayload {
                task_name: task_name.clone(),
                data: data.clone(),
                metadata: metadata.clone(),
            }),
        ),
        StatusEvent::Failed {
            task_name,
            error_type,
            context,
        } => (
            "FAILED",
            serde_json::to_value(FailedPayload {
                task_name: task_name.clone(),
                error_type: *error_type,
                context: context.clone(),
            }),
        ),
        StatusEvent::ParseError { .. } => return None,
    };

    let payload = payload.ok()?;
    Some(format!("[TASK_STATUS:{kind}]{payload}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_log_line_is_not_an_event() {
        assert_eq!(decode_line("navigating to login page"), None);
        assert_eq!(decode_line(""), None);
    }

    #[test]
    fn marker_mid_line_is_a_log_line() {
        // The grammar is anchored; only lines starting with the marker count.
        assert_eq!(
            decode_line("worker said [TASK_STATUS:STARTED]{\"taskName\":\"a\"}"),
            None
        );
    }

    #[test]
    fn decode_started() {
        let ev = decode_line(r#"[TASK_STATUS:STARTED]{"taskName":"check-flights"}"#).unwrap();
        assert_eq!(
            ev,
            StatusEvent::Started {
                task_name: "check-flights".to_string()
            }
        );
        assert!(!ev.is_terminal());
    }

    #[test]
    fn decode_completed_without_duration() {
        let ev = decode_line(r#"[TASK_STATUS:COMPLETED]{"taskName":"t"}"#).unwrap();
        assert_eq!(
            ev,
            StatusEvent::Completed {
                task_name: "t".to_string(),
                duration_ms: None
            }
        );
        assert!(ev.is_terminal());
    }

    #[test]
    fn decode_completed_with_duration() {
        let ev = decode_line(r#"[TASK_STATUS:COMPLETED]{"taskName":"t","durationMs":1532}"#)
            .unwrap();
        assert_eq!(
            ev,
            StatusEvent::Completed {
                task_name: "t".to_string(),
                duration_ms: Some(1532)
            }
        );
    }

    #[test]
    fn decode_completed_with_data() {
        let line = r#"[TASK_STATUS:COMPLETED_WITH_DATA]{"taskName":"price-watch","data":{"price":42.5},"metadata":{"category":"shopping","dataType":"price","ttlSeconds":3600}}"#;
        match decode_line(line).unwrap() {
            StatusEvent::CompletedWithData {
                task_name,
                data,
                metadata,
            } => {
                assert_eq!(task_name, "price-watch");
                assert_eq!(data["price"], 42.5);
                assert_eq!(metadata.category, "shopping");
                assert_eq!(metadata.data_type, "price");
                assert_eq!(metadata.ttl_seconds, Some(3600));
                assert_eq!(metadata.rendered_by, None);
            }
            other => panic!("expected CompletedWithData, got {other:?}"),
        }
    }

    #[test]
    fn decode_failed_with_context() {
        let line = r##"[TASK_STATUS:FAILED]{"taskName":"login","errorType":"element_not_found","context":{"selector":"#submit","url":"https://example.com/login"}}"##;
        match decode_line(line).unwrap() {
            StatusEvent::Failed {
                task_name,
                error_type,
                context,
            } => {
                assert_eq!(task_name, "login");
                assert_eq!(error_type, ErrorType::ElementNotFound);
                assert_eq!(context["selector"], "#submit");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_becomes_parse_error() {
        let ev = decode_line("[TASK_STATUS:STARTED]{not json").unwrap();
        match ev {
            StatusEvent::ParseError { status, raw, .. } => {
                assert_eq!(status, "STARTED");
                assert!(raw.contains("not json"));
            }
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn wrong_payload_shape_becomes_parse_error() {
        // Valid JSON, but FAILED requires errorType and an object context.
        let ev = decode_line(r#"[TASK_STATUS:FAILED]{"taskName":"t"}"#).unwrap();
        assert!(matches!(ev, StatusEvent::ParseError { .. }));
    }

    #[test]
    fn unknown_status_kind_becomes_parse_error() {
        let ev = decode_line(r#"[TASK_STATUS:RETRYING]{"taskName":"t"}"#).unwrap();
        match ev {
            StatusEvent::ParseError { status, message, .. } => {
                assert_eq!(status, "RETRYING");
                assert!(message.contains("unknown status kind"));
            }
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_is_not_terminal_and_has_no_task() {
        let ev = decode_line("[TASK_STATUS:FAILED]oops").unwrap();
        assert!(!ev.is_terminal());
        assert_eq!(ev.task_name(), None);
        assert_eq!(ev.kind(), "PARSE_ERROR");
    }

    #[test]
    fn encode_failed_roundtrips() {
        let mut context = serde_json::Map::new();
        context.insert("selector".to_string(), serde_json::json!(".price"));
        let ev = StatusEvent::Failed {
            task_name: "watch".to_string(),
            error_type: ErrorType::Timeout,
            context,
        };
        let line = encode_line(&ev).unwrap();
        assert!(line.starts_with("[TASK_STATUS:FAILED]"));
        assert_eq!(decode_line(&line).unwrap(), ev);
    }

    #[test]
    fn parse_error_has_no_wire_form() {
        let ev = StatusEvent::ParseError {
            status: "FAILED".to_string(),
            raw: "x".to_string(),
            message: "y".to_string(),
        };
        assert!(encode_line(&ev).is_none());
    }

    #[test]
    fn error_type_string_forms() {
        assert_eq!(ErrorType::ElementNotFound.to_string(), "element_not_found");
        assert_eq!(
            "navigation_failure".parse::<ErrorType>().unwrap(),
            ErrorType::NavigationFailure
        );
        assert!("explosion".parse::<ErrorType>().is_err());
    }

    #[test]
    fn windows_line_endings_are_tolerated() {
        let ev = decode_line("[TASK_STATUS:STARTED]{\"taskName\":\"t\"}\r");
        assert!(matches!(ev, Some(StatusEvent::Started { .. })));
    }
}
