use crate::AgentError;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_AGENT_PATH: &str = "../woo_agent";
pub const DEFAULT_ENTRYPOINT: &str = "app.py";
pub const DEFAULT_PROGRAM: &str = "python";
pub const DEFAULT_AGENT_PORT: u16 = 5000;
pub const DEFAULT_MODEL_NAME: &str = "gpt-4o";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory expected to hold the entry point.
    pub agent_path: PathBuf,
    /// Searched when `agent_path` does not contain the entry point.
    pub fallback_path: Option<PathBuf>,
    pub entrypoint: String,
    pub program: String,
    pub bridge_host: String,
    pub agent_port: u16,
    pub model_name: String,
    pub warmup: Duration,
    pub settle: Duration,
    pub stop_timeout: Duration,
    pub bridge_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_path: PathBuf::from(DEFAULT_AGENT_PATH),
            fallback_path: default_fallback_path(),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            program: DEFAULT_PROGRAM.to_string(),
            bridge_host: "localhost".to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            model_name: DEFAULT_MODEL_NAME.to_string(),
            warmup: Duration::from_millis(3000),
            settle: Duration::from_millis(1000),
            stop_timeout: Duration::from_millis(5000),
            bridge_timeout: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    pub fn chat_url(&self) -> String {
        format!("http://{}:{}/api/chat", self.bridge_host, self.agent_port)
    }

    /// Finds the first candidate directory that holds the entry point.
    /// Re-evaluated on every start so a fixed-up path is picked up without a restart.
    pub fn resolve_agent_dir(&self) -> Result<PathBuf, AgentError> {
        let mut candidates = vec![self.agent_path.clone()];
        if let Some(fallback) = &self.fallback_path {
            if fallback != &self.agent_path {
                candidates.push(fallback.clone());
            }
        }
        for dir in &candidates {
            if dir.join(&self.entrypoint).is_file() {
                return Ok(dir.clone());
            }
        }

        let expected = self.agent_path.join(&self.entrypoint);
        let reason = if !self.agent_path.is_dir() {
            format!(
                "agent directory does not exist (searched {})",
                describe(&candidates)
            )
        } else {
            format!(
                "{} not found (searched {})",
                self.entrypoint,
                describe(&candidates)
            )
        };
        Err(AgentError::EntrypointNotFound {
            path: expected,
            reason,
        })
    }
}

fn default_fallback_path() -> Option<PathBuf> {
    std::env::current_dir()
        .ok()
        .map(|cwd| cwd.join("..").join("woo_agent"))
}

fn describe(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn entrypoint_path(dir: &Path, entrypoint: &str) -> PathBuf {
    dir.join(entrypoint)
}
