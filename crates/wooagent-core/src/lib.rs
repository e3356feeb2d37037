use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod emit;
pub mod sanitize;
pub mod trace;
pub mod wire;

pub use emit::{LogEmitter, TraceHandle};
pub use trace::TraceAggregator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    Step,
    Thought,
    ToolCall,
    ToolResult,
    Message,
    Completion,
    Error,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Start => "start",
            StepType::Step => "step",
            StepType::Thought => "thought",
            StepType::ToolCall => "tool_call",
            StepType::ToolResult => "tool_result",
            StepType::Message => "message",
            StepType::Completion => "completion",
            StepType::Error => "error",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable fact about something that happened, optionally linked into a trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl LogEntry {
    /// Builds a sanitized entry stamped with a fresh id and the current time.
    pub fn new(level: LogLevel, agent: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            id: new_id(),
            timestamp: Utc::now(),
            level,
            message: sanitize::clean_message(message.as_ref()),
            agent: agent.into(),
            details: None,
            trace_id: None,
            parent_id: None,
            step_type: None,
            duration: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = sanitize::clean_details(details);
        self
    }

    pub fn in_trace(mut self, trace_id: impl Into<String>, step_type: StepType) -> Self {
        self.trace_id = Some(trace_id.into());
        self.step_type = Some(step_type);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = Some(duration_ms);
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == LogLevel::Error
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Error,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Running => "running",
            TraceStatus::Completed => "completed",
            TraceStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TraceStatus::Running)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution session rebuilt from every entry sharing a trace id.
///
/// `steps` keeps arrival order, which is not necessarily timestamp order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TraceGroup {
    pub id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    #[serde(default)]
    pub steps: Vec<LogEntry>,
}

impl TraceGroup {
    pub fn is_active(&self) -> bool {
        self.status == TraceStatus::Running
    }

    /// Steps whose `parentId` names an entry that has not been seen in this group.
    pub fn unresolved_parents(&self) -> Vec<&LogEntry> {
        self.steps
            .iter()
            .filter(|step| {
                step.parent_id
                    .as_deref()
                    .is_some_and(|parent| !self.steps.iter().any(|other| other.id == parent))
            })
            .collect()
    }
}

pub fn trace_name(trace_id: &str) -> String {
    let prefix: String = trace_id.chars().take(8).collect();
    format!("Trace {prefix}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Read-only view over the supervised process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub connection_status: ConnectionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatReply {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

pub const DEFAULT_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub error_only: bool,
}

impl LogQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }

    pub fn reads_error_file(&self) -> bool {
        self.error_only || self.level == Some(LogLevel::Error)
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(agent) = self.agent.as_deref().filter(|value| !value.is_empty()) {
            if entry.agent != agent {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().filter(|value| !value.is_empty()) {
            let needle = search.to_lowercase();
            let in_message = entry.message.to_lowercase().contains(&needle);
            let in_agent = entry.agent.to_lowercase().contains(&needle);
            let in_details = entry
                .details
                .as_ref()
                .map(|details| details.to_string().to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_message && !in_agent && !in_details {
                return false;
            }
        }
        true
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_entry_serializes_camel_case_and_omits_empty_links() {
        let entry = LogEntry::new(LogLevel::Warning, "AgentService", "hello")
            .in_trace("abc", StepType::ToolCall)
            .with_duration(12);
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["level"], "warning");
        assert_eq!(value["traceId"], "abc");
        assert_eq!(value["stepType"], "tool_call");
        assert_eq!(value["duration"], 12);
        assert!(value.get("parentId").is_none());
        assert!(value.get("details").is_none());
    }

    #[test]
    fn log_level_accepts_warn_alias() {
        let level: LogLevel = serde_json::from_value(json!("warn")).expect("alias");
        assert_eq!(level, LogLevel::Warning);
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn query_search_covers_message_agent_and_details() {
        let entry = LogEntry::new(LogLevel::Info, "ProductAgent", "listing items")
            .with_details(json!({"sku": "WIDGET-42"}));
        let by_details = LogQuery {
            search: Some("widget-42".to_string()),
            ..LogQuery::default()
        };
        let by_agent = LogQuery {
            search: Some("productagent".to_string()),
            ..LogQuery::default()
        };
        let miss = LogQuery {
            search: Some("coupon".to_string()),
            ..LogQuery::default()
        };
        assert!(by_details.matches(&entry));
        assert!(by_agent.matches(&entry));
        assert!(!miss.matches(&entry));
    }

    #[test]
    fn query_level_and_agent_are_exact() {
        let entry = LogEntry::new(LogLevel::Error, "AgentService", "boom");
        let wrong_level = LogQuery {
            level: Some(LogLevel::Info),
            ..LogQuery::default()
        };
        let wrong_agent = LogQuery {
            agent: Some("Agent".to_string()),
            ..LogQuery::default()
        };
        assert!(!wrong_level.matches(&entry));
        assert!(!wrong_agent.matches(&entry));
        assert!(LogQuery::default().matches(&entry));
        assert!(LogQuery {
            level: Some(LogLevel::Error),
            ..LogQuery::default()
        }
        .reads_error_file());
    }

    #[test]
    fn unresolved_parents_reports_dangling_links() {
        let root = LogEntry::new(LogLevel::Info, "a", "call").in_trace("t", StepType::ToolCall);
        let child = LogEntry::new(LogLevel::Info, "a", "result")
            .in_trace("t", StepType::ToolResult)
            .with_parent(root.id.clone());
        let orphan = LogEntry::new(LogLevel::Info, "a", "late")
            .in_trace("t", StepType::Step)
            .with_parent("missing");
        let group = TraceGroup {
            id: "t".to_string(),
            name: trace_name("t"),
            start_time: root.timestamp,
            end_time: None,
            status: TraceStatus::Running,
            steps: vec![root, child, orphan.clone()],
        };
        let unresolved = group.unresolved_parents();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, orphan.id);
    }

    #[test]
    fn trace_name_uses_id_prefix() {
        assert_eq!(trace_name("0123456789abcdef"), "Trace 01234567");
        assert_eq!(trace_name("T1"), "Trace T1");
    }
}
