use crate::HubError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use wooagent_core::wire::{encode_event, ClientRequest, ConnectionStatusPayload, ServerEvent};
use wooagent_core::{AgentStatus, LogEntry, LogQuery, TraceGroup};
use wooagent_storage::{LogStore, StorageError};

pub type ClientId = u64;

/// Encoded `{"event","data"}` frames queued for one subscriber.
pub type FrameSender = mpsc::Sender<String>;

enum Command {
    Ingest(LogEntry),
    Attach {
        client_id: ClientId,
        sender: FrameSender,
        history_limit: usize,
        reply: oneshot::Sender<bool>,
    },
    Detach {
        client_id: ClientId,
    },
    Pull {
        client_id: ClientId,
        request: ClientRequest,
    },
    AgentStatus(AgentStatus),
    RecentLogs {
        limit: usize,
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    QueryLogs {
        query: LogQuery,
        reply: oneshot::Sender<Result<Vec<LogEntry>, StorageError>>,
    },
    GetTrace {
        trace_id: String,
        reply: oneshot::Sender<Option<TraceGroup>>,
    },
    ListTraces {
        active_only: bool,
        reply: oneshot::Sender<Vec<TraceGroup>>,
    },
    ClearTraces {
        reply: oneshot::Sender<usize>,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Cloneable front door to the ingestion thread.
///
/// Every store read and write goes through one ordered queue, so subscribers
/// see mutations in exactly the order they were applied.
#[derive(Clone)]
pub struct PipelineHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_client: Arc<AtomicU64>,
}

/// Owns the ingestion thread and the task feeding it from the log emitter.
pub struct Pipeline {
    handle: PipelineHandle,
    thread: Option<thread::JoinHandle<()>>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Pipeline {
    /// Must be called from inside a tokio runtime.
    pub fn spawn(
        store: LogStore,
        entries: mpsc::UnboundedReceiver<LogEntry>,
    ) -> Result<Self, HubError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name("wooagent-ingest".to_string())
            .spawn(move || run(store, command_rx))
            .map_err(HubError::Thread)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_entries(entries, commands.clone(), shutdown_rx));
        Ok(Self {
            handle: PipelineHandle {
                commands,
                next_client: Arc::new(AtomicU64::new(0)),
            },
            thread: Some(thread),
            forwarder: Some(forwarder),
            shutdown_tx,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Flushes entries already emitted, stops the thread and joins it.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!(event = "pipeline_join_failed");
            }
        }
    }
}

impl PipelineHandle {
    pub fn ingest(&self, entry: LogEntry) {
        let _ = self.commands.send(Command::Ingest(entry));
    }

    /// Sends the replay to `sender` and registers it for live frames in one step.
    pub async fn attach(
        &self,
        sender: FrameSender,
        history_limit: usize,
    ) -> Result<ClientId, HubError> {
        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Attach {
            client_id,
            sender,
            history_limit,
            reply,
        })?;
        match rx.await {
            Ok(true) => Ok(client_id),
            Ok(false) => Err(HubError::ReplayFailed),
            Err(_) => Err(HubError::PipelineClosed),
        }
    }

    pub fn detach(&self, client_id: ClientId) {
        let _ = self.commands.send(Command::Detach { client_id });
    }

    pub fn pull(&self, client_id: ClientId, request: ClientRequest) {
        let _ = self.commands.send(Command::Pull { client_id, request });
    }

    pub fn publish_status(&self, status: AgentStatus) {
        let _ = self.commands.send(Command::AgentStatus(status));
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, HubError> {
        self.ask(|reply| Command::RecentLogs { limit, reply }).await
    }

    pub async fn query_logs(&self, query: LogQuery) -> Result<Vec<LogEntry>, HubError> {
        self.ask(|reply| Command::QueryLogs { query, reply })
            .await?
            .map_err(HubError::Storage)
    }

    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceGroup>, HubError> {
        let trace_id = trace_id.to_string();
        self.ask(|reply| Command::GetTrace { trace_id, reply }).await
    }

    pub async fn list_traces(&self, active_only: bool) -> Result<Vec<TraceGroup>, HubError> {
        self.ask(|reply| Command::ListTraces { active_only, reply })
            .await
    }

    pub async fn clear_traces(&self) -> Result<usize, HubError> {
        self.ask(|reply| Command::ClearTraces { reply }).await
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        self.ask(|reply| Command::SubscriberCount { reply }).await
    }

    fn send(&self, command: Command) -> Result<(), HubError> {
        self.commands
            .send(command)
            .map_err(|_| HubError::PipelineClosed)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| HubError::PipelineClosed)
    }
}

async fn forward_entries(
    mut entries: mpsc::UnboundedReceiver<LogEntry>,
    commands: mpsc::UnboundedSender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            entry = entries.recv() => match entry {
                Some(entry) => {
                    if commands.send(Command::Ingest(entry)).is_err() {
                        return;
                    }
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    while let Ok(entry) = entries.try_recv() {
        let _ = commands.send(Command::Ingest(entry));
    }
    let _ = commands.send(Command::Shutdown);
}

struct PipelineState {
    store: LogStore,
    subscribers: HashMap<ClientId, FrameSender>,
    last_status: AgentStatus,
}

fn run(store: LogStore, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut state = PipelineState {
        store,
        subscribers: HashMap::new(),
        last_status: AgentStatus::default(),
    };
    info!(
        event = "pipeline_started",
        recent = state.store.recent_len(),
        traces = state.store.trace_count()
    );
    while let Some(command) = commands.blocking_recv() {
        if matches!(command, Command::Shutdown) {
            break;
        }
        state.handle(command);
    }
    info!(event = "pipeline_stopped", subscribers = state.subscribers.len());
}

impl PipelineState {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Ingest(entry) => self.ingest(entry),
            Command::Attach {
                client_id,
                sender,
                history_limit,
                reply,
            } => {
                let attached = self.attach(client_id, sender, history_limit);
                let _ = reply.send(attached);
            }
            Command::Detach { client_id } => {
                if self.subscribers.remove(&client_id).is_some() {
                    info!(event = "subscriber_detached", client_id);
                }
            }
            Command::Pull { client_id, request } => self.pull(client_id, request),
            Command::AgentStatus(status) => {
                self.last_status = status.clone();
                self.broadcast(&ServerEvent::AgentStatus(status));
            }
            Command::RecentLogs { limit, reply } => {
                let _ = reply.send(self.store.recent(limit));
            }
            Command::QueryLogs { query, reply } => {
                let _ = reply.send(self.store.query(&query));
            }
            Command::GetTrace { trace_id, reply } => {
                let _ = reply.send(self.store.get_trace(&trace_id));
            }
            Command::ListTraces { active_only, reply } => {
                let _ = reply.send(self.store.list_traces(active_only));
            }
            Command::ClearTraces { reply } => {
                let cleared = self.store.clear_traces();
                info!(event = "traces_cleared", count = cleared);
                let _ = reply.send(cleared);
            }
            Command::SubscriberCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
            Command::Shutdown => {}
        }
    }

    fn ingest(&mut self, entry: LogEntry) {
        debug!(
            event = "log_entry",
            level = %entry.level,
            agent = %entry.agent,
            trace_id = entry.trace_id.as_deref().unwrap_or(""),
            message = %entry.message
        );
        let outcome = self.store.ingest(entry);
        if let Some(err) = &outcome.persist_error {
            warn!(event = "log_persist_failed", error = %err);
        }
        self.broadcast(&ServerEvent::Log(outcome.entry));
        if let Some(trace) = outcome.trace {
            self.broadcast(&ServerEvent::Trace(trace));
        }
    }

    fn attach(&mut self, client_id: ClientId, sender: FrameSender, history_limit: usize) -> bool {
        let replay = [
            ServerEvent::ConnectionStatus(ConnectionStatusPayload { is_connected: true }),
            ServerEvent::LogHistory(self.store.recent(history_limit)),
            ServerEvent::TraceHistory(self.store.list_traces(true)),
            ServerEvent::AgentStatus(self.last_status.clone()),
        ];
        for event in &replay {
            let Some(frame) = encode(event) else {
                return false;
            };
            if sender.try_send(frame).is_err() {
                warn!(event = "replay_failed", client_id);
                return false;
            }
        }
        self.subscribers.insert(client_id, sender);
        info!(
            event = "subscriber_attached",
            client_id,
            subscribers = self.subscribers.len()
        );
        true
    }

    fn pull(&mut self, client_id: ClientId, request: ClientRequest) {
        let event = match request {
            ClientRequest::GetLogs { limit } => ServerEvent::LogHistory(self.store.recent(limit)),
            ClientRequest::GetTraces => ServerEvent::TraceHistory(self.store.list_traces(true)),
            ClientRequest::GetTrace { trace_id } => match self.store.get_trace(&trace_id) {
                Some(trace) => ServerEvent::Trace(trace),
                None => ServerEvent::error(format!("Trace with ID {trace_id} not found")),
            },
        };
        let Some(sender) = self.subscribers.get(&client_id) else {
            debug!(event = "pull_unknown_client", client_id);
            return;
        };
        let Some(frame) = encode(&event) else {
            return;
        };
        if let Err(err) = sender.try_send(frame) {
            self.evict(client_id, &err);
        }
    }

    fn broadcast(&mut self, event: &ServerEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        let Some(frame) = encode(event) else {
            return;
        };
        let mut slow = Vec::new();
        for (client_id, sender) in &self.subscribers {
            if let Err(err) = sender.try_send(frame.clone()) {
                slow.push((*client_id, err));
            }
        }
        for (client_id, err) in slow {
            self.evict(client_id, &err);
        }
    }

    fn evict(&mut self, client_id: ClientId, err: &mpsc::error::TrySendError<String>) {
        match err {
            mpsc::error::TrySendError::Full(_) => {
                warn!(event = "subscriber_slow_consumer", client_id);
            }
            mpsc::error::TrySendError::Closed(_) => {
                debug!(event = "subscriber_closed", client_id);
            }
        }
        self.subscribers.remove(&client_id);
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match encode_event(event) {
        Ok(frame) => Some(frame),
        Err(err) => {
            error!(event = "frame_encode_failed", kind = event.name(), error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;
    use wooagent_core::{LogEmitter, LogLevel, StepType};
    use wooagent_storage::StoreConfig;

    fn open_store(dir: &TempDir) -> LogStore {
        LogStore::open(StoreConfig::new(dir.path().join("logs"))).expect("store")
    }

    fn frame_event(frame: &str) -> (String, Value) {
        let value: Value = serde_json::from_str(frame).expect("frame json");
        (
            value["event"].as_str().expect("event").to_string(),
            value["data"].clone(),
        )
    }

    async fn next_event(rx: &mut mpsc::Receiver<String>) -> (String, Value) {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("frame in time")
            .expect("open queue");
        frame_event(&frame)
    }

    #[tokio::test]
    async fn attach_replays_history_then_streams_live() {
        let dir = TempDir::new().expect("tempdir");
        let (emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(open_store(&dir), entries).expect("pipeline");
        let handle = pipeline.handle();

        emitter.info("system", "before attach");
        let trace = emitter.start_trace("work", "AgentService");
        // wait until both entries are applied
        let recent = loop {
            let recent = handle.recent_logs(10).await.expect("recent");
            if recent.len() == 2 {
                break recent;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(recent[1].message, "before attach");

        let (tx, mut rx) = mpsc::channel(16);
        handle.attach(tx, 100).await.expect("attach");
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "connection_status");
        assert_eq!(data["isConnected"], true);
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "log_history");
        assert_eq!(data.as_array().expect("array").len(), 2);
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "trace_history");
        assert_eq!(data[0]["id"], trace.trace_id());
        let (name, _) = next_event(&mut rx).await;
        assert_eq!(name, "agent_status");

        trace.complete("done", None);
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "log");
        assert_eq!(data["stepType"], "completion");
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "trace");
        assert_eq!(data["status"], "completed");

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn pull_requests_answer_from_store() {
        let dir = TempDir::new().expect("tempdir");
        let (_emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(open_store(&dir), entries).expect("pipeline");
        let handle = pipeline.handle();

        let (tx, mut rx) = mpsc::channel(16);
        let client = handle.attach(tx, 100).await.expect("attach");
        for _ in 0..4 {
            next_event(&mut rx).await;
        }

        handle.ingest(
            LogEntry::new(LogLevel::Info, "AgentService", "call")
                .in_trace("T1", StepType::ToolCall),
        );
        assert_eq!(next_event(&mut rx).await.0, "log");
        assert_eq!(next_event(&mut rx).await.0, "trace");

        handle.pull(client, ClientRequest::GetLogs { limit: 1 });
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "log_history");
        assert_eq!(data.as_array().expect("array").len(), 1);

        handle.pull(
            client,
            ClientRequest::GetTrace {
                trace_id: "T1".to_string(),
            },
        );
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "trace");
        assert_eq!(data["steps"].as_array().expect("steps").len(), 1);

        handle.pull(
            client,
            ClientRequest::GetTrace {
                trace_id: "missing".to_string(),
            },
        );
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "error");
        assert_eq!(data["message"], "Trace with ID missing not found");

        handle.pull(client, ClientRequest::GetTraces);
        let (name, data) = next_event(&mut rx).await;
        assert_eq!(name, "trace_history");
        assert_eq!(data.as_array().expect("array").len(), 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_evicts_subscriber() {
        let dir = TempDir::new().expect("tempdir");
        let (_emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(open_store(&dir), entries).expect("pipeline");
        let handle = pipeline.handle();

        let (tx, _rx) = mpsc::channel(4);
        handle.attach(tx, 100).await.expect("attach");
        assert_eq!(handle.subscriber_count().await.expect("count"), 1);

        handle.ingest(LogEntry::new(LogLevel::Info, "system", "overflow"));
        assert_eq!(handle.subscriber_count().await.expect("count"), 0);

        let (tiny, _tiny_rx) = mpsc::channel(1);
        assert!(matches!(
            handle.attach(tiny, 100).await,
            Err(HubError::ReplayFailed)
        ));
        assert_eq!(handle.subscriber_count().await.expect("count"), 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn detach_and_closed_queues_are_removed() {
        let dir = TempDir::new().expect("tempdir");
        let (_emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(open_store(&dir), entries).expect("pipeline");
        let handle = pipeline.handle();

        let (tx_a, rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let a = handle.attach(tx_a, 10).await.expect("attach a");
        handle.attach(tx_b, 10).await.expect("attach b");
        assert_eq!(handle.subscriber_count().await.expect("count"), 2);

        drop(rx_a);
        handle.ingest(LogEntry::new(LogLevel::Info, "system", "ping"));
        assert_eq!(handle.subscriber_count().await.expect("count"), 1);
        handle.detach(a);
        assert_eq!(handle.subscriber_count().await.expect("count"), 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_emitted_entries() {
        let dir = TempDir::new().expect("tempdir");
        let (emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(open_store(&dir), entries).expect("pipeline");
        for idx in 0..50 {
            emitter.info("system", format!("entry {idx}"));
        }
        pipeline.shutdown().await;

        let store = open_store(&dir);
        assert_eq!(store.recent_len(), 50);
        assert_eq!(store.recent(1)[0].message, "entry 49");
    }

    #[tokio::test]
    async fn status_updates_are_broadcast_and_replayed() {
        let dir = TempDir::new().expect("tempdir");
        let (_emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(open_store(&dir), entries).expect("pipeline");
        let handle = pipeline.handle();

        handle.publish_status(AgentStatus {
            is_running: true,
            ..AgentStatus::default()
        });
        let (tx, mut rx) = mpsc::channel(16);
        handle.attach(tx, 10).await.expect("attach");
        let mut last = None;
        for _ in 0..4 {
            last = Some(next_event(&mut rx).await);
        }
        let (name, data) = last.expect("replay");
        assert_eq!(name, "agent_status");
        assert_eq!(data["isRunning"], true);

        pipeline.shutdown().await;
    }
}
