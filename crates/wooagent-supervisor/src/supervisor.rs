use crate::bridge::{decode_reply, AgentBridge};
use crate::config::{entrypoint_path, SupervisorConfig};
use crate::output::{OutputRing, OutputStream};
use crate::recovery::{HeuristicRecovery, RecoveryStrategy};
use crate::{
    is_no_answer, AgentError, APOLOGY_REPLY, NO_RESPONSE_REPLY, PROCESS_AGENT, SUPERVISOR_AGENT,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wooagent_core::{AgentStatus, ChatReply, ConnectionStatus, LogEmitter, TraceHandle};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_PREVIEW_CHARS: usize = 30;
const BRIDGE_TOOL: &str = "agent_http_bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Stopped => "stopped",
            AgentPhase::Starting => "starting",
            AgentPhase::Running => "running",
            AgentPhase::Stopping => "stopping",
        }
    }
}

struct ProcessState {
    phase: AgentPhase,
    generation: u64,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    kill_tx: Option<oneshot::Sender<()>>,
    connection: ConnectionStatus,
}

struct Inner {
    config: SupervisorConfig,
    emitter: LogEmitter,
    bridge: AgentBridge,
    recovery: Box<dyn RecoveryStrategy>,
    state: Mutex<ProcessState>,
    output: Arc<Mutex<OutputRing>>,
    phase_tx: watch::Sender<AgentPhase>,
    status_tx: watch::Sender<AgentStatus>,
}

/// Owns the external agent process and everything that talks to it.
///
/// The child handle lives inside a monitor task; other components only see
/// [`AgentStatus`] snapshots. Cloning shares the same supervisor.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<Inner>,
}

impl AgentSupervisor {
    pub fn new(config: SupervisorConfig, emitter: LogEmitter) -> Result<Self, AgentError> {
        Self::with_recovery(config, emitter, Box::new(HeuristicRecovery))
    }

    pub fn with_recovery(
        config: SupervisorConfig,
        emitter: LogEmitter,
        recovery: Box<dyn RecoveryStrategy>,
    ) -> Result<Self, AgentError> {
        let bridge = AgentBridge::new(&config)?;
        let state = ProcessState {
            phase: AgentPhase::Stopped,
            generation: 0,
            pid: None,
            started_at: None,
            kill_tx: None,
            connection: ConnectionStatus::Disconnected,
        };
        let initial = snapshot(&config, &state);
        let (phase_tx, _) = watch::channel(AgentPhase::Stopped);
        let (status_tx, _) = watch::channel(initial);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                emitter,
                bridge,
                recovery,
                state: Mutex::new(state),
                output: Arc::new(Mutex::new(OutputRing::default())),
                phase_tx,
                status_tx,
            }),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn status(&self) -> AgentStatus {
        let state = self.inner.lock_state();
        snapshot(&self.inner.config, &state)
    }

    /// Pushes a fresh snapshot on every lifecycle transition.
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn phase(&self) -> AgentPhase {
        self.inner.lock_state().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == AgentPhase::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock_state().pid
    }

    pub fn recent_output(&self) -> Vec<String> {
        lock(&self.inner.output).lines_since(0)
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        let emitter = &self.inner.emitter;
        let trace = emitter.start_trace("Start agent", SUPERVISOR_AGENT);
        {
            let mut state = self.inner.lock_state();
            match state.phase {
                AgentPhase::Running | AgentPhase::Starting => {
                    trace.complete(
                        "Agent is already running",
                        Some(json!({ "pid": state.pid, "phase": state.phase.as_str() })),
                    );
                    return Ok(());
                }
                AgentPhase::Stopping => {
                    trace.fail("Agent is still stopping", None);
                    return Err(AgentError::Stopping);
                }
                AgentPhase::Stopped => self.inner.transition(&mut state, AgentPhase::Starting),
            }
        }

        match self.launch(&trace) {
            Ok(pid) => {
                info!(event = "agent_started", pid = ?pid);
                emitter.info(
                    SUPERVISOR_AGENT,
                    format!("Agent started (pid {})", describe_pid(pid)),
                );
                trace.complete("Agent started", Some(json!({ "pid": pid })));
                Ok(())
            }
            Err(err) => {
                {
                    let mut state = self.inner.lock_state();
                    if matches!(err, AgentError::Spawn { .. }) {
                        state.connection = ConnectionStatus::Error;
                    }
                    self.inner.transition(&mut state, AgentPhase::Stopped);
                }
                error!(event = "agent_start_failed", error = %err);
                emitter.error(SUPERVISOR_AGENT, format!("Failed to start agent: {err}"));
                trace.fail(
                    format!("Failed to start agent: {err}"),
                    Some(json!({ "error": err.to_string() })),
                );
                Err(err)
            }
        }
    }

    fn launch(&self, trace: &TraceHandle) -> Result<Option<u32>, AgentError> {
        let config = &self.inner.config;
        trace.step("Resolving agent entry point");
        let dir = config.resolve_agent_dir()?;
        trace.step_with(
            "Launching agent process",
            json!({
                "program": config.program,
                "entrypoint": entrypoint_path(&dir, &config.entrypoint).display().to_string(),
                "cwd": dir.display().to_string(),
            }),
        );

        let mut command = Command::new(&config.program);
        command
            .arg(&config.entrypoint)
            .current_dir(&dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so stop also reaches helpers that share the output pipes.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let pid = child.id();

        lock(&self.inner.output).reset();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let reader = tokio::spawn(capture_stream(
                stdout,
                OutputStream::Stdout,
                self.inner.output.clone(),
                self.inner.emitter.clone(),
            ));
            readers.push((OutputStream::Stdout, reader));
        }
        if let Some(stderr) = child.stderr.take() {
            let reader = tokio::spawn(capture_stream(
                stderr,
                OutputStream::Stderr,
                self.inner.output.clone(),
                self.inner.emitter.clone(),
            ));
            readers.push((OutputStream::Stderr, reader));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let generation = {
            let mut state = self.inner.lock_state();
            state.generation += 1;
            state.pid = pid;
            state.started_at = Some(Utc::now());
            state.kill_tx = Some(kill_tx);
            state.connection = ConnectionStatus::Connected;
            self.inner.transition(&mut state, AgentPhase::Running);
            state.generation
        };
        tokio::spawn(monitor(
            self.inner.clone(),
            child,
            generation,
            kill_rx,
            readers,
        ));
        Ok(pid)
    }

    /// Signals the process and waits up to `stop_timeout` for it to exit.
    /// On timeout the transition to `Stopped` completes in the background.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let trace = self
            .inner
            .emitter
            .start_trace("Stop agent", SUPERVISOR_AGENT);
        let timeout = self.inner.config.stop_timeout;
        let mut phase_rx = self.inner.phase_tx.subscribe();
        if *phase_rx.borrow() == AgentPhase::Starting {
            let _ = tokio::time::timeout(
                timeout,
                phase_rx.wait_for(|phase| *phase != AgentPhase::Starting),
            )
            .await;
        }

        {
            let mut state = self.inner.lock_state();
            match state.phase {
                AgentPhase::Stopped => {
                    trace.complete("Agent is not running", None);
                    return Ok(());
                }
                AgentPhase::Starting => {
                    trace.fail("Agent is still starting", None);
                    return Err(AgentError::Starting);
                }
                AgentPhase::Stopping => {
                    trace.step("Stop already in progress");
                }
                AgentPhase::Running => {
                    trace.step_with("Sending termination signal", json!({ "pid": state.pid }));
                    if let Some(kill_tx) = state.kill_tx.take() {
                        let _ = kill_tx.send(());
                    }
                    self.inner.transition(&mut state, AgentPhase::Stopping);
                }
            }
        }

        let exited = tokio::time::timeout(
            timeout,
            phase_rx.wait_for(|phase| *phase == AgentPhase::Stopped),
        )
        .await
        .map(|changed| changed.is_ok())
        .unwrap_or(false);
        if exited {
            trace.complete("Agent stopped", None);
        } else {
            warn!(event = "agent_stop_pending", timeout_ms = timeout.as_millis() as u64);
            trace.complete(
                format!(
                    "Agent did not exit within {}ms; stop continues in the background",
                    timeout.as_millis()
                ),
                None,
            );
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), AgentError> {
        let trace = self
            .inner
            .emitter
            .start_trace("Restart agent", SUPERVISOR_AGENT);
        trace.step("Stopping agent");
        if let Err(err) = self.stop().await {
            trace.fail(format!("Restart aborted: {err}"), None);
            return Err(err);
        }
        trace.step("Waiting before start");
        tokio::time::sleep(self.inner.config.settle).await;
        match self.start().await {
            Ok(()) => {
                trace.complete("Agent restarted", None);
                Ok(())
            }
            Err(err) => {
                trace.fail(format!("Restart failed: {err}"), None);
                Err(err)
            }
        }
    }

    /// Forwards one chat message to the agent, starting it first if needed.
    ///
    /// Always yields a reply: transport failures become a fixed apology and
    /// unusable answers go through the recovery strategy.
    pub async fn send_message(&self, text: &str) -> ChatReply {
        let inner = &self.inner;
        let emitter = &inner.emitter;
        let trace = emitter.start_trace("Send message to agent", SUPERVISOR_AGENT);
        let cursor = lock(&inner.output).cursor();

        if !self.is_running() {
            trace.step("Agent is not running, starting it automatically");
            emitter.warn(SUPERVISOR_AGENT, "Message sent while the agent is not running");
            if let Err(err) = self.start().await {
                let message = format!("Unable to start the agent: {err}");
                trace.fail(message.clone(), None);
                return ChatReply::now(message);
            }
            trace.step("Waiting for agent warm-up");
            tokio::time::sleep(inner.config.warmup).await;
        }

        trace.message("user", text);
        trace.step(format!("Sending request to agent: {}", preview(text)));
        emitter.info(SUPERVISOR_AGENT, format!("Sending message to agent: {text}"));
        let call_id = trace.tool_call(
            BRIDGE_TOOL,
            json!({ "url": inner.bridge.url(), "messageLength": text.chars().count() }),
        );
        let started = Instant::now();
        let body = match inner.bridge.chat(text).await {
            Ok(body) => body,
            Err(err) => {
                let elapsed = started.elapsed().as_millis() as u64;
                trace.tool_result(
                    BRIDGE_TOOL,
                    json!({ "error": err.to_string() }),
                    Some(&call_id),
                    Some(elapsed),
                );
                warn!(event = "agent_bridge_failed", error = %err);
                emitter.error(SUPERVISOR_AGENT, format!("Failed to send message to agent: {err}"));
                trace.fail(format!("Failed to send message to agent: {err}"), None);
                return ChatReply::now(APOLOGY_REPLY);
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;
        trace.tool_result(
            BRIDGE_TOOL,
            json!({ "bytes": body.len() }),
            Some(&call_id),
            Some(elapsed),
        );
        emitter.info(SUPERVISOR_AGENT, format!("Received reply from agent: {body}"));

        let mut message = decode_reply(&body);
        if is_no_answer(&message) {
            trace.thought("Agent gave no usable answer; checking its recent output");
            let output = lock(&inner.output).lines_since(cursor);
            if let Some(recovered) = inner.recovery.recover(&output) {
                trace.step(recovered.reason);
                message = recovered.message;
            }
        }
        if is_no_answer(&message) {
            message = NO_RESPONSE_REPLY.to_string();
        }

        trace.message("agent", &message);
        trace.complete(
            "Response processed",
            Some(json!({ "responseLength": message.chars().count() })),
        );
        ChatReply::now(message)
    }

    pub async fn shutdown(&self) {
        if let Err(err) = self.stop().await {
            warn!(event = "agent_shutdown_failed", error = %err);
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        lock(&self.state)
    }

    /// Publishes the phase and a status snapshot while the state lock is held,
    /// so subscribers observe transitions in order.
    fn transition(&self, state: &mut ProcessState, phase: AgentPhase) {
        state.phase = phase;
        debug!(event = "agent_phase", phase = phase.as_str());
        self.phase_tx.send_replace(phase);
        self.status_tx.send_replace(snapshot(&self.config, state));
    }

    fn on_exit(&self, generation: u64, status: io::Result<ExitStatus>, requested: bool) {
        let mut state = self.lock_state();
        if state.generation != generation {
            debug!(event = "agent_exit_stale", generation);
            return;
        }
        let expected = requested || state.phase == AgentPhase::Stopping;
        let pid = state.pid.take();
        state.started_at = None;
        state.kill_tx = None;
        let code = status.as_ref().ok().and_then(|status| status.code());
        let exit = match (&status, code) {
            (_, Some(code)) => format!("code {code}"),
            (Ok(_), None) => "signal".to_string(),
            (Err(err), None) => format!("wait error: {err}"),
        };

        if expected {
            state.connection = ConnectionStatus::Disconnected;
            self.transition(&mut state, AgentPhase::Stopped);
            info!(event = "agent_stopped", pid = ?pid, exit = %exit);
            self.emitter
                .info(SUPERVISOR_AGENT, format!("Agent process exited ({exit})"));
        } else {
            state.connection = ConnectionStatus::Error;
            self.transition(&mut state, AgentPhase::Stopped);
            warn!(event = "agent_crashed", pid = ?pid, exit = %exit);
            self.emitter.error_with(
                SUPERVISOR_AGENT,
                format!("Agent process closed unexpectedly ({exit})"),
                json!({ "pid": pid, "code": code }),
            );
        }
    }
}

async fn monitor(
    inner: Arc<Inner>,
    mut child: Child,
    generation: u64,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<(OutputStream, JoinHandle<()>)>,
) {
    let pid = child.id();
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill_rx => {
            terminate(&mut child, pid);
            (child.wait().await, true)
        }
    };
    // Leftover group members would keep serving the port and writing output.
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            if let Err(err) = kill_group(pid) {
                debug!(event = "agent_group_reap_failed", error = %err);
            }
        }
    }
    for (stream, mut reader) in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            warn!(event = "agent_output_reader_aborted", stream = stream.as_str());
            reader.abort();
        }
    }
    inner.on_exit(generation, status, requested);
}

fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            match kill_group(pid) {
                Ok(()) => return,
                Err(err) => warn!(event = "agent_group_kill_failed", pid, error = %err),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(err) = child.start_kill() {
        warn!(event = "agent_kill_failed", error = %err);
    }
}

/// SIGKILLs every process in the group led by `pid`. An empty group is not an error.
#[cfg(unix)]
fn kill_group(pid: u32) -> io::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

async fn capture_stream<R>(
    reader: R,
    stream: OutputStream,
    output: Arc<Mutex<OutputRing>>,
    emitter: LogEmitter,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf);
        let text = line.trim_end_matches(|ch| ch == '\n' || ch == '\r');
        if text.trim().is_empty() {
            continue;
        }
        lock(&output).push(stream, text);
        match stream {
            OutputStream::Stdout => emitter.info(PROCESS_AGENT, text),
            OutputStream::Stderr => emitter.warn(PROCESS_AGENT, text),
        }
    }
}

fn snapshot(config: &SupervisorConfig, state: &ProcessState) -> AgentStatus {
    let is_running = state.phase == AgentPhase::Running;
    let uptime = state
        .started_at
        .filter(|_| is_running)
        .map(|started| (Utc::now() - started).num_seconds().max(0) as u64);
    AgentStatus {
        is_running,
        start_time: state.started_at,
        uptime,
        model_name: Some(config.model_name.clone()),
        connection_status: state.connection,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(REQUEST_PREVIEW_CHARS).collect();
    if text.chars().count() > REQUEST_PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

fn describe_pid(pid: Option<u32>) -> String {
    pid.map(|pid| pid.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::recovery::NoRecovery;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use wooagent_core::{LogEntry, LogLevel, StepType};

    const IDLE_AGENT: &str = "echo ready\nexec sleep 30\n";

    fn write_agent(dir: &Path, body: &str) {
        fs::write(dir.join("agent.sh"), body).expect("write agent script");
    }

    fn test_config(dir: &Path, port: u16) -> SupervisorConfig {
        SupervisorConfig {
            agent_path: dir.to_path_buf(),
            fallback_path: None,
            entrypoint: "agent.sh".to_string(),
            program: "sh".to_string(),
            bridge_host: "127.0.0.1".to_string(),
            agent_port: port,
            model_name: "test-model".to_string(),
            warmup: Duration::from_millis(500),
            settle: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(5),
            bridge_timeout: Duration::from_secs(5),
        }
    }

    async fn chat_server(reply: Value) -> u16 {
        let app = Router::new().route(
            "/api/chat",
            post(move || {
                let reply = reply.clone();
                async move { Json(reply) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        listener.local_addr().expect("addr").port()
    }

    fn supervisor(dir: &Path, port: u16) -> AgentSupervisor {
        AgentSupervisor::new(test_config(dir, port), LogEmitter::sink()).expect("supervisor")
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_handle() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), IDLE_AGENT);
        let sup = supervisor(dir.path(), unused_port().await);

        sup.stop().await.expect("stop while stopped");
        sup.start().await.expect("start");
        let pid = sup.pid().expect("pid");
        assert!(sup.status().is_running);
        assert_eq!(sup.status().connection_status, ConnectionStatus::Connected);

        sup.start().await.expect("second start");
        assert_eq!(sup.pid(), Some(pid));

        sup.stop().await.expect("stop");
        assert_eq!(sup.phase(), AgentPhase::Stopped);
        let status = sup.status();
        assert!(!status.is_running);
        assert!(status.start_time.is_none());
        assert_eq!(status.connection_status, ConnectionStatus::Disconnected);
        assert!(sup.pid().is_none());

        sup.stop().await.expect("stop again");
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_one_process() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), IDLE_AGENT);
        let sup = supervisor(dir.path(), unused_port().await);

        let (a, b) = tokio::join!(sup.start(), sup.start());
        a.expect("first");
        b.expect("second");
        let pid = sup.pid().expect("pid");
        sup.start().await.expect("third");
        assert_eq!(sup.pid(), Some(pid));
        sup.shutdown().await;
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn missing_entrypoint_fails_without_state_change() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(dir.path(), unused_port().await);
        let err = sup.start().await.expect_err("missing entry point");
        assert!(matches!(err, AgentError::EntrypointNotFound { .. }));
        assert!(err.to_string().contains("agent.sh"));
        assert_eq!(sup.phase(), AgentPhase::Stopped);
        assert_eq!(
            sup.status().connection_status,
            ConnectionStatus::Disconnected
        );

        write_agent(dir.path(), IDLE_AGENT);
        sup.start().await.expect("start after fixing path");
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported_as_crash() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), "echo boom >&2\nexit 3\n");
        let sup = supervisor(dir.path(), unused_port().await);
        sup.start().await.expect("start");

        let mut status_rx = sup.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|status| {
                !status.is_running && status.connection_status == ConnectionStatus::Error
            }),
        )
        .await
        .expect("crash notification")
        .expect("status channel");
        assert_eq!(sup.phase(), AgentPhase::Stopped);
        assert!(sup.pid().is_none());
        assert_eq!(sup.recent_output(), vec!["boom"]);
    }

    #[tokio::test]
    async fn restart_replaces_process() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), IDLE_AGENT);
        let sup = supervisor(dir.path(), unused_port().await);
        sup.start().await.expect("start");
        let first = sup.pid().expect("pid");
        sup.restart().await.expect("restart");
        let second = sup.pid().expect("pid");
        assert_ne!(first, second);
        assert!(sup.is_running());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn bridge_failure_yields_apology_after_auto_start() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), IDLE_AGENT);
        let sup = supervisor(dir.path(), unused_port().await);

        let reply = sup.send_message("list products").await;
        assert_eq!(reply.message, APOLOGY_REPLY);
        assert!(sup.status().is_running);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn auto_start_failure_is_reported_as_reply() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(dir.path(), unused_port().await);
        let reply = sup.send_message("hello").await;
        assert!(reply.message.starts_with("Unable to start the agent:"));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn structured_reply_is_used_verbatim() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), "echo 'נמצאו מוצרים בחנות: true'\nexec sleep 30\n");
        let port = chat_server(serde_json::json!({ "response": "3 products found" })).await;
        let sup = supervisor(dir.path(), port);
        sup.start().await.expect("start");

        let reply = sup.send_message("list products").await;
        assert_eq!(reply.message, "3 products found");
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn empty_reply_recovers_answer_from_output() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(
            dir.path(),
            "echo 'התחברות לחנות WooCommerce הצליחה: https://shop.example.com' >&2\necho 'נמצאו מוצרים בחנות: true'\nexec sleep 30\n",
        );
        let port = chat_server(serde_json::json!({})).await;
        let sup = supervisor(dir.path(), port);

        let reply = sup.send_message("list products").await;
        assert!(
            reply
                .message
                .starts_with("I found products in the store at https://shop.example.com."),
            "unexpected reply: {}",
            reply.message
        );
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_recovery_reports_no_response() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), "echo 'נמצאו מוצרים בחנות: true'\nexec sleep 30\n");
        let port = chat_server(serde_json::json!({})).await;
        let sup = AgentSupervisor::with_recovery(
            test_config(dir.path(), port),
            LogEmitter::sink(),
            Box::new(NoRecovery),
        )
        .expect("supervisor");

        let reply = sup.send_message("list products").await;
        assert_eq!(reply.message, NO_RESPONSE_REPLY);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn stop_kills_helpers_sharing_the_output_pipes() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(
            dir.path(),
            "echo ready\n(sleep 1; echo orphan-line) &\nexec sleep 30\n",
        );
        let sup = supervisor(dir.path(), unused_port().await);
        sup.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(200)).await;

        sup.stop().await.expect("stop");
        assert_eq!(sup.phase(), AgentPhase::Stopped);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sup.recent_output(), vec!["ready"]);
    }

    #[tokio::test]
    async fn process_output_is_logged_per_stream() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(
            dir.path(),
            "echo out-line\necho err-line >&2\nexec sleep 30\n",
        );
        let (emitter, mut rx) = LogEmitter::channel();
        let sup = AgentSupervisor::new(test_config(dir.path(), unused_port().await), emitter)
            .expect("supervisor");
        assert_eq!(sup.config().entrypoint, "agent.sh");
        sup.start().await.expect("start");

        let mut captured: Vec<LogEntry> = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while captured.len() < 2 {
                let entry = rx.recv().await.expect("emitter open");
                if entry.agent == PROCESS_AGENT {
                    captured.push(entry);
                }
            }
        })
        .await
        .expect("both streams captured");
        sup.shutdown().await;

        let level_of = |message: &str| {
            captured
                .iter()
                .find(|entry| entry.message == message)
                .map(|entry| entry.level)
        };
        assert_eq!(level_of("out-line"), Some(LogLevel::Info));
        assert_eq!(level_of("err-line"), Some(LogLevel::Warning));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stop_returns_before_a_slow_exit_completes() {
        let dir = TempDir::new().expect("tempdir");
        // A helper in its own session keeps stdout open past the group kill.
        write_agent(dir.path(), "setsid sleep 3 &\nexec sleep 30\n");
        let mut config = test_config(dir.path(), unused_port().await);
        config.stop_timeout = Duration::from_millis(200);
        let sup = AgentSupervisor::new(config, LogEmitter::sink()).expect("supervisor");
        sup.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        sup.stop().await.expect("stop");
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(sup.phase(), AgentPhase::Stopping);

        let mut status_rx = sup.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|status| {
                status.connection_status == ConnectionStatus::Disconnected
            }),
        )
        .await
        .expect("background stop finishes")
        .expect("status channel");
        assert_eq!(sup.phase(), AgentPhase::Stopped);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn operations_are_recorded_as_traces() {
        let dir = TempDir::new().expect("tempdir");
        write_agent(dir.path(), IDLE_AGENT);
        let (emitter, mut rx) = LogEmitter::channel();
        let sup = AgentSupervisor::new(test_config(dir.path(), unused_port().await), emitter)
            .expect("supervisor");
        sup.start().await.expect("start");
        sup.stop().await.expect("stop");

        let mut entries: Vec<LogEntry> = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        let starts: Vec<_> = entries
            .iter()
            .filter(|entry| entry.step_type == Some(StepType::Start))
            .map(|entry| entry.message.as_str())
            .collect();
        assert_eq!(
            starts,
            vec!["Starting process: Start agent", "Starting process: Stop agent"]
        );
        let completions = entries
            .iter()
            .filter(|entry| entry.step_type == Some(StepType::Completion))
            .count();
        assert_eq!(completions, 2);
    }
}
