use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub mod bridge;
pub mod config;
pub mod output;
pub mod recovery;
pub mod supervisor;

pub use bridge::{decode_reply, AgentBridge};
pub use config::SupervisorConfig;
pub use output::{OutputRing, OutputStream, OUTPUT_CAPACITY};
pub use recovery::{HeuristicRecovery, NoRecovery, Recovered, RecoveryStrategy};
pub use supervisor::{AgentPhase, AgentSupervisor};

/// Component name stamped on the supervisor's own log entries.
pub const SUPERVISOR_AGENT: &str = "AgentService";
/// Component name stamped on lines captured from the agent process.
pub const PROCESS_AGENT: &str = "AgentProcess";

pub const NO_RESPONSE_REPLY: &str = "No response from the agent";
pub const APOLOGY_REPLY: &str = "Sorry, I could not get a response from the agent. There may be a connection problem or the agent may not be running properly.";

/// Replies that carry no answer and trigger recovery from captured output.
pub const NO_ANSWER_SENTINELS: [&str; 4] =
    ["", "{}", NO_RESPONSE_REPLY, "אין תשובה מהסוכן"];

pub fn is_no_answer(message: &str) -> bool {
    let trimmed = message.trim();
    NO_ANSWER_SENTINELS.contains(&trimmed)
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent entry point not found at {}: {reason}", .path.display())]
    EntrypointNotFound { path: PathBuf, reason: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("agent is still starting")]
    Starting,
    #[error("agent is still stopping")]
    Stopping,
    #[error("agent bridge request failed: {0}")]
    Bridge(#[source] reqwest::Error),
    #[error("agent bridge returned HTTP {status}: {body}")]
    BridgeStatus { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_trigger_recovery() {
        for sentinel in NO_ANSWER_SENTINELS {
            assert!(is_no_answer(sentinel));
        }
        assert!(is_no_answer("  {} "));
        assert!(!is_no_answer("3 products found"));
    }
}
