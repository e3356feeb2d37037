use crate::{gateway, AppState, HubError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use wooagent_core::{LogLevel, LogQuery};
use wooagent_supervisor::AgentError;

const CHAT_AGENT: &str = "ChatAPI";
const CHAT_PREVIEW_CHARS: usize = 50;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/start", post(agent_start))
        .route("/api/agent/stop", post(agent_stop))
        .route("/api/agent/restart", post(agent_restart))
        .route("/api/chat/message", post(chat_message))
        .route("/api/logs", get(list_logs))
        .route("/api/traces", get(list_traces).delete(clear_traces))
        .route("/api/traces/:id", get(get_trace))
        .route("/ws", get(gateway::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn agent_status(State(state): State<AppState>) -> Response {
    Json(json!({ "success": true, "status": state.supervisor.status() })).into_response()
}

async fn agent_start(State(state): State<AppState>) -> Response {
    let result = state.supervisor.start().await;
    lifecycle_response(&state, result, "Agent started", "Failed to start agent")
}

async fn agent_stop(State(state): State<AppState>) -> Response {
    let result = state.supervisor.stop().await;
    lifecycle_response(&state, result, "Agent stopped", "Failed to stop agent")
}

async fn agent_restart(State(state): State<AppState>) -> Response {
    let result = state.supervisor.restart().await;
    lifecycle_response(&state, result, "Agent restarted", "Failed to restart agent")
}

fn lifecycle_response(
    state: &AppState,
    result: Result<(), AgentError>,
    done: &str,
    failed: &str,
) -> Response {
    let status = state.supervisor.status();
    match result {
        Ok(()) => {
            Json(json!({ "success": true, "message": done, "status": status })).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "message": format!("{failed}: {err}"),
                "status": status,
            })),
        )
            .into_response(),
    }
}

async fn chat_message(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .filter(|message| !message.trim().is_empty());
    let Some(message) = message else {
        return failure(StatusCode::BAD_REQUEST, "Message is empty or invalid");
    };

    let mut preview: String = message.chars().take(CHAT_PREVIEW_CHARS).collect();
    if message.chars().count() > CHAT_PREVIEW_CHARS {
        preview.push_str("...");
    }
    state.emitter.info_with(
        CHAT_AGENT,
        format!("Received chat message: {preview}"),
        json!({ "messageId": wooagent_core::new_id() }),
    );

    let reply = state.supervisor.send_message(message).await;
    Json(json!({
        "success": true,
        "message": reply.message,
        "timestamp": reply.timestamp,
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsParams {
    limit: Option<usize>,
    level: Option<String>,
    agent: Option<String>,
    search: Option<String>,
    error_only: Option<String>,
}

async fn list_logs(State(state): State<AppState>, Query(params): Query<LogsParams>) -> Response {
    let level = match params.level.as_deref().filter(|level| !level.trim().is_empty()) {
        Some(raw) => match raw.parse::<LogLevel>() {
            Ok(level) => Some(level),
            Err(err) => return failure(StatusCode::BAD_REQUEST, &err),
        },
        None => None,
    };
    let query = LogQuery {
        limit: params.limit,
        level,
        agent: params.agent,
        search: params.search,
        error_only: params.error_only.as_deref() == Some("true"),
    };
    match state.pipeline.query_logs(query).await {
        Ok(logs) => {
            let total = logs.len();
            Json(json!({ "success": true, "logs": logs, "total": total })).into_response()
        }
        Err(err) => internal("Failed to read logs", &err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct TracesParams {
    active: Option<bool>,
}

async fn list_traces(
    State(state): State<AppState>,
    Query(params): Query<TracesParams>,
) -> Response {
    match state.pipeline.list_traces(params.active.unwrap_or(false)).await {
        Ok(traces) => {
            let total = traces.len();
            Json(json!({ "success": true, "traces": traces, "total": total })).into_response()
        }
        Err(err) => internal("Failed to read traces", &err),
    }
}

async fn get_trace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.pipeline.get_trace(&id).await {
        Ok(Some(trace)) => Json(json!({ "success": true, "trace": trace })).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, &format!("Trace with ID {id} not found")),
        Err(err) => internal("Failed to read trace", &err),
    }
}

async fn clear_traces(State(state): State<AppState>) -> Response {
    match state.pipeline.clear_traces().await {
        Ok(cleared) => Json(json!({ "success": true, "cleared": cleared })).into_response(),
        Err(err) => internal("Failed to clear traces", &err),
    }
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "message": message }))).into_response()
}

fn internal(message: &str, err: &HubError) -> Response {
    error!(event = "request_failed", error = %err);
    failure(StatusCode::INTERNAL_SERVER_ERROR, message)
}
