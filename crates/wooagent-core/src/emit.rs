use crate::{new_id, LogEntry, LogLevel, StepType};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const MESSAGE_PREVIEW_CHARS: usize = 100;

/// Producer side of the ingestion queue.
///
/// Cloning is cheap; every clone feeds the same ordered queue. Sending never
/// blocks and is a no-op once the consumer has gone away.
#[derive(Clone, Debug)]
pub struct LogEmitter {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl LogEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// An emitter whose entries go nowhere.
    pub fn sink() -> Self {
        let (emitter, _rx) = Self::channel();
        emitter
    }

    pub fn emit(&self, entry: LogEntry) {
        let _ = self.tx.send(entry);
    }

    pub fn debug(&self, agent: &str, message: impl AsRef<str>) {
        self.emit(LogEntry::new(LogLevel::Debug, agent, message));
    }

    pub fn info(&self, agent: &str, message: impl AsRef<str>) {
        self.emit(LogEntry::new(LogLevel::Info, agent, message));
    }

    pub fn warn(&self, agent: &str, message: impl AsRef<str>) {
        self.emit(LogEntry::new(LogLevel::Warning, agent, message));
    }

    pub fn error(&self, agent: &str, message: impl AsRef<str>) {
        self.emit(LogEntry::new(LogLevel::Error, agent, message));
    }

    pub fn info_with(&self, agent: &str, message: impl AsRef<str>, details: Value) {
        self.emit(LogEntry::new(LogLevel::Info, agent, message).with_details(details));
    }

    pub fn error_with(&self, agent: &str, message: impl AsRef<str>, details: Value) {
        self.emit(LogEntry::new(LogLevel::Error, agent, message).with_details(details));
    }

    /// Opens a new trace and records its `start` step.
    pub fn start_trace(&self, name: &str, agent: &str) -> TraceHandle {
        let handle = TraceHandle {
            emitter: self.clone(),
            trace_id: new_id(),
            agent: agent.to_string(),
        };
        handle.record(
            LogEntry::new(LogLevel::Info, agent, format!("Starting process: {name}"))
                .with_details(json!({ "name": name })),
            StepType::Start,
        );
        handle
    }
}

/// Records steps into a single trace.
#[derive(Clone, Debug)]
pub struct TraceHandle {
    emitter: LogEmitter,
    trace_id: String,
    agent: String,
}

impl TraceHandle {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn step(&self, message: impl AsRef<str>) -> String {
        self.record(self.entry(LogLevel::Info, message), StepType::Step)
    }

    pub fn step_with(&self, message: impl AsRef<str>, details: Value) -> String {
        self.record(
            self.entry(LogLevel::Info, message).with_details(details),
            StepType::Step,
        )
    }

    pub fn thought(&self, message: impl AsRef<str>) -> String {
        self.record(self.entry(LogLevel::Info, message), StepType::Thought)
    }

    /// Returns the call's entry id so the matching result can point back at it.
    pub fn tool_call(&self, tool: &str, params: Value) -> String {
        self.record(
            self.entry(LogLevel::Info, format!("Calling tool: {tool}"))
                .with_details(params),
            StepType::ToolCall,
        )
    }

    pub fn tool_result(
        &self,
        tool: &str,
        result: Value,
        parent_id: Option<&str>,
        duration_ms: Option<u64>,
    ) -> String {
        let mut entry = self
            .entry(LogLevel::Info, format!("Tool result: {tool}"))
            .with_details(result);
        if let Some(parent) = parent_id {
            entry = entry.with_parent(parent);
        }
        if let Some(duration) = duration_ms {
            entry = entry.with_duration(duration);
        }
        self.record(entry, StepType::ToolResult)
    }

    pub fn message(&self, role: &str, content: &str) -> String {
        let mut preview: String = content.chars().take(MESSAGE_PREVIEW_CHARS).collect();
        if content.chars().count() > MESSAGE_PREVIEW_CHARS {
            preview.push_str("...");
        }
        self.record(
            self.entry(LogLevel::Info, format!("{role}: {preview}"))
                .with_details(json!({ "role": role, "content": content })),
            StepType::Message,
        )
    }

    pub fn complete(self, message: impl AsRef<str>, details: Option<Value>) -> String {
        let mut entry = self.entry(LogLevel::Info, message);
        if let Some(details) = details {
            entry = entry.with_details(details);
        }
        self.record(entry, StepType::Completion)
    }

    pub fn fail(self, message: impl AsRef<str>, details: Option<Value>) -> String {
        let mut entry = self.entry(LogLevel::Error, message);
        if let Some(details) = details {
            entry = entry.with_details(details);
        }
        self.record(entry, StepType::Error)
    }

    fn entry(&self, level: LogLevel, message: impl AsRef<str>) -> LogEntry {
        LogEntry::new(level, self.agent.as_str(), message)
    }

    fn record(&self, entry: LogEntry, step_type: StepType) -> String {
        let entry = entry.in_trace(self.trace_id.clone(), step_type);
        let id = entry.id.clone();
        self.emitter.emit(entry);
        id
    }
}
