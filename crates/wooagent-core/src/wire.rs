use crate::{AgentStatus, LogEntry, TraceGroup};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_CLIENT_FRAME_BYTES: usize = 64 * 1024;

/// Frames pushed from the hub to a live subscriber: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionStatus(ConnectionStatusPayload),
    LogHistory(Vec<LogEntry>),
    Log(LogEntry),
    TraceHistory(Vec<TraceGroup>),
    Trace(TraceGroup),
    AgentStatus(AgentStatus),
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionStatus(_) => "connection_status",
            ServerEvent::LogHistory(_) => "log_history",
            ServerEvent::Log(_) => "log",
            ServerEvent::TraceHistory(_) => "trace_history",
            ServerEvent::Trace(_) => "trace",
            ServerEvent::AgentStatus(_) => "agent_status",
            ServerEvent::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusPayload {
    pub is_connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

/// Requests a subscriber may send back over its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    GetLogs { limit: usize },
    GetTraces,
    GetTrace { trace_id: String },
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct GetLogsPayload {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTracePayload {
    trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("invalid frame: {0}")]
    Malformed(String),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
}

pub fn parse_client_request(raw: &[u8]) -> Result<ClientRequest, RequestError> {
    if raw.len() > MAX_CLIENT_FRAME_BYTES {
        return Err(RequestError::Oversized {
            size: raw.len(),
            max: MAX_CLIENT_FRAME_BYTES,
        });
    }
    let frame: ClientFrame =
        serde_json::from_slice(raw).map_err(|err| RequestError::Malformed(err.to_string()))?;
    match frame.event.as_str() {
        "get_logs" => {
            let payload: GetLogsPayload = payload_or_default(&frame)?;
            let limit = payload
                .limit
                .filter(|limit| *limit > 0)
                .unwrap_or(DEFAULT_HISTORY_LIMIT);
            Ok(ClientRequest::GetLogs { limit })
        }
        "get_traces" => Ok(ClientRequest::GetTraces),
        "get_trace" => {
            let payload: GetTracePayload = serde_json::from_value(frame.data.clone())
                .map_err(|err| invalid(&frame, err.to_string()))?;
            if payload.trace_id.trim().is_empty() {
                return Err(invalid(&frame, "missing traceId".to_string()));
            }
            Ok(ClientRequest::GetTrace {
                trace_id: payload.trace_id,
            })
        }
        other => Err(RequestError::UnknownEvent(other.to_string())),
    }
}

fn payload_or_default<T>(frame: &ClientFrame) -> Result<T, RequestError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if frame.data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(frame.data.clone()).map_err(|err| invalid(frame, err.to_string()))
}

fn invalid(frame: &ClientFrame, reason: String) -> RequestError {
    RequestError::InvalidPayload {
        event: frame.event.clone(),
        reason,
    }
}

pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
