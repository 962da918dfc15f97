//! WebSocket + REST endpoints for the dashboard.
//!
//! The WebSocket stream is observational: clients get a scheduler status
//! snapshot on connect, then every [`Notification`] as it is published.
//! Mutations go through the REST routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, TaskError};
use crate::events::{Notification, Notifier};
use crate::info::InfoResult;
use crate::orchestrator::Orchestrator;
use crate::scheduler::{ScheduleEntry, Scheduler};
use crate::supervisor::TriggerKind;
use crate::tasks::TaskDef;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub notifier: Notifier,
}

/// Build the Axum router with the dashboard WebSocket and REST routes.
pub fn routes(
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    notifier: Notifier,
) -> Router {
    let state = AppState {
        orchestrator,
        scheduler,
        notifier,
    };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{name}", delete(remove_task))
        .route("/api/tasks/{name}/run", post(run_task))
        .route("/api/runs", get(list_runs))
        .route("/api/failures", get(list_failures))
        .route("/api/failures/{id}/dismiss", post(dismiss_failure))
        .route("/api/failures/clear", post(clear_failures))
        .route("/api/info", get(list_info))
        .route("/api/info/clear", post(clear_info))
        .route("/api/info/{task}", delete(remove_info))
        .route("/api/schedule", get(list_schedule).post(add_schedule))
        .route("/api/schedule/{id}", delete(remove_schedule))
        // The dashboard is served from its own origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(err: Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        Error::Task(TaskError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Task(TaskError::Disabled { .. }) => StatusCode::BAD_REQUEST,
        Error::Schedule(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()})))
}

fn db_error(err: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "webpilot"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.scheduler, state.notifier))
}

async fn handle_socket(mut socket: WebSocket, scheduler: Arc<Scheduler>, notifier: Notifier) {
    info!("WebSocket client connected");

    // Send a scheduler status snapshot on connect
    if !send_status(&mut socket, &scheduler).await {
        warn!("Failed to send initial status, client disconnected");
        return;
    }

    // Subscribe to broadcast channel for real-time updates
    let mut rx = notifier.subscribe();

    loop {
        tokio::select! {
            // Forward broadcast events to this client
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        // Re-sync with a fresh status snapshot
                        if !send_status(&mut socket, &scheduler).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            // The stream is one-way; client frames are only connection upkeep
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(text = %text, "Ignoring WS message from client");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn send_status(socket: &mut WebSocket, scheduler: &Scheduler) -> bool {
    let status: Notification = scheduler.status().await;
    match serde_json::to_string(&status) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

// ── Tasks & runs ────────────────────────────────────────────────────────

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.catalog().list().await {
        Ok(tasks) => (StatusCode::OK, Json(serde_json::json!(tasks))),
        Err(e) => db_error(e),
    }
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    name: String,
    display_name: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_enabled() -> bool {
    true
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let mut task = TaskDef::new(body.name, body.display_name, body.category);
    task.description = body.description;
    task.enabled = body.enabled;

    match state.orchestrator.catalog().upsert(&task).await {
        Ok(()) => {
            info!(task = %task.name, "Task definition saved via API");
            (StatusCode::CREATED, Json(serde_json::json!(task)))
        }
        Err(e) => db_error(e),
    }
}

async fn remove_task(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.orchestrator.catalog().remove(&name).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "removed"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Task not found"})),
        ),
        Err(e) => db_error(e),
    }
}

async fn run_task(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.orchestrator.run_now(&name, TriggerKind::Manual).await {
        Ok(handle) => {
            info!(task = %name, run_id = %handle.run_id, "Run requested via API");
            (StatusCode::OK, Json(serde_json::json!(handle)))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct RunsQuery {
    #[serde(default = "default_runs_limit")]
    limit: u32,
}

fn default_runs_limit() -> u32 {
    50
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    match state.orchestrator.recent_runs(query.limit).await {
        Ok(runs) => (StatusCode::OK, Json(serde_json::json!(runs))),
        Err(e) => db_error(e),
    }
}

// ── Failures ────────────────────────────────────────────────────────────

async fn list_failures(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.failures().list().await {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!(records))),
        Err(e) => db_error(e),
    }
}

async fn dismiss_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let record_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid failure ID"})),
            );
        }
    };

    match state.orchestrator.failures().dismiss(record_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "dismissed"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Failure record not found"})),
        ),
        Err(e) => db_error(e),
    }
}

async fn clear_failures(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.failures().clear_all().await {
        Ok(cleared) => (StatusCode::OK, Json(serde_json::json!({"cleared": cleared}))),
        Err(e) => db_error(e),
    }
}

// ── Info-gathering results ──────────────────────────────────────────────

/// A cached result with its staleness at read time.
#[derive(Serialize)]
struct InfoEntry {
    #[serde(flatten)]
    result: InfoResult,
    stale: bool,
}

async fn list_info(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.info().list(Utc::now()).await {
        Ok(results) => {
            let entries: Vec<InfoEntry> = results
                .into_iter()
                .map(|(result, stale)| InfoEntry { result, stale })
                .collect();
            (StatusCode::OK, Json(serde_json::json!(entries)))
        }
        Err(e) => db_error(e),
    }
}

async fn remove_info(State(state): State<AppState>, Path(task): Path<String>) -> impl IntoResponse {
    match state.orchestrator.info().remove(&task).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "removed"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "No cached result for task"})),
        ),
        Err(e) => db_error(e),
    }
}

async fn clear_info(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.info().clear_all().await {
        Ok(cleared) => (StatusCode::OK, Json(serde_json::json!({"cleared": cleared}))),
        Err(e) => db_error(e),
    }
}

// ── Schedule ────────────────────────────────────────────────────────────

async fn list_schedule(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.entries().await {
        Ok(entries) => (StatusCode::OK, Json(serde_json::json!(entries))),
        Err(e) => db_error(e),
    }
}

#[derive(Deserialize)]
struct AddScheduleRequest {
    task: String,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    execute_at: Option<String>,
}

async fn add_schedule(
    State(state): State<AppState>,
    Json(body): Json<AddScheduleRequest>,
) -> impl IntoResponse {
    let entry = if let Some(cron) = body.cron {
        ScheduleEntry::recurring(body.task, cron)
    } else if let Some(at) = body.execute_at {
        ScheduleEntry::one_shot(body.task, at)
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Either cron or execute_at is required"})),
        );
    };

    match state.scheduler.add_entry(entry).await {
        Ok(entry) => {
            info!(entry_id = %entry.id, task = %entry.task, "Schedule entry added via API");
            (StatusCode::CREATED, Json(serde_json::json!(entry)))
        }
        Err(e) => error_response(e),
    }
}

async fn remove_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let entry_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid entry ID"})),
            );
        }
    };

    match state.scheduler.remove_entry(entry_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "removed"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Schedule entry not found"})),
        ),
        Err(e) => error_response(e),
    }
}
