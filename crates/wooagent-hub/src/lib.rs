pub mod config;
pub mod gateway;
pub mod logging;
pub mod pipeline;
pub mod routes;

use axum::Router;
use config::{GatewayConfig, HubConfig};
use pipeline::{Pipeline, PipelineHandle};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use wooagent_core::{AgentStatus, LogEmitter};
use wooagent_storage::{LogStore, StorageError};
use wooagent_supervisor::{AgentError, AgentSupervisor};

const HUB_AGENT: &str = "Hub";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("log pipeline is closed")]
    PipelineClosed,
    #[error("subscriber queue rejected the replay")]
    ReplayFailed,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("failed to spawn ingestion thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Shared by every route and socket handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: AgentSupervisor,
    pub pipeline: PipelineHandle,
    pub emitter: LogEmitter,
    pub gateway: Arc<GatewayConfig>,
}

pub struct Hub {
    state: AppState,
    pipeline: Pipeline,
    status_task: JoinHandle<()>,
}

impl Hub {
    /// Opens the store, starts the ingestion thread and wires the supervisor to it.
    /// Must be called from inside a tokio runtime.
    pub fn init(config: HubConfig) -> Result<Self, HubError> {
        let store = LogStore::open(config.store.clone())?;
        let (emitter, entries) = LogEmitter::channel();
        let pipeline = Pipeline::spawn(store, entries)?;
        let handle = pipeline.handle();
        let supervisor = AgentSupervisor::new(config.supervisor.clone(), emitter.clone())?;
        let status_task = tokio::spawn(forward_status(supervisor.subscribe(), handle.clone()));
        info!(
            event = "hub_init",
            data_dir = %config.store.dir.display(),
            agent_path = %config.supervisor.agent_path.display()
        );
        emitter.info(HUB_AGENT, "Log hub started");
        Ok(Self {
            state: AppState {
                supervisor,
                pipeline: handle,
                emitter,
                gateway: Arc::new(config.gateway),
            },
            pipeline,
            status_task,
        })
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn emitter(&self) -> &LogEmitter {
        &self.state.emitter
    }

    /// Stops the agent, then flushes every emitted entry to disk.
    pub async fn shutdown(self) {
        self.state.supervisor.shutdown().await;
        self.status_task.abort();
        // The forwarder may not have seen the last transition yet.
        self.state
            .pipeline
            .publish_status(self.state.supervisor.status());
        self.state.emitter.info(HUB_AGENT, "Log hub stopped");
        self.pipeline.shutdown().await;
        info!(event = "hub_shutdown");
    }
}

async fn forward_status(mut statuses: watch::Receiver<AgentStatus>, pipeline: PipelineHandle) {
    let initial = statuses.borrow_and_update().clone();
    pipeline.publish_status(initial);
    while statuses.changed().await.is_ok() {
        let status = statuses.borrow_and_update().clone();
        pipeline.publish_status(status);
    }
}
