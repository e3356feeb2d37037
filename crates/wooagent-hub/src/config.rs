use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use wooagent_storage::{StoreConfig, DEFAULT_RECENT_CAPACITY};
use wooagent_supervisor::config::{
    DEFAULT_AGENT_PATH, DEFAULT_AGENT_PORT, DEFAULT_ENTRYPOINT, DEFAULT_MODEL_NAME,
    DEFAULT_PROGRAM,
};
use wooagent_supervisor::SupervisorConfig;

pub const DEFAULT_ADDR: &str = "127.0.0.1:3001";
pub const DEFAULT_DATA_DIR: &str = "logs";
pub const DEFAULT_LOG_DIR: &str = ".wooagent/logs";

#[derive(Parser, Debug, Clone)]
#[command(name = "wooagent-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub data_dir: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value = "")]
    pub agent_path: String,
    #[arg(long, default_value = DEFAULT_ENTRYPOINT)]
    pub agent_entrypoint: String,
    #[arg(long, default_value = "")]
    pub agent_program: String,
    #[arg(long)]
    pub agent_port: Option<u16>,
    #[arg(long, default_value = "")]
    pub model_name: String,
    #[arg(long, default_value_t = 3000)]
    pub warmup_ms: u64,
    #[arg(long, default_value_t = 1000)]
    pub settle_ms: u64,
    #[arg(long, default_value_t = 5000)]
    pub stop_timeout_ms: u64,
    #[arg(long, default_value_t = 60)]
    pub bridge_timeout_secs: u64,
    #[arg(long, default_value_t = 100)]
    pub history_limit: usize,
    #[arg(long, default_value_t = DEFAULT_RECENT_CAPACITY)]
    pub recent_capacity: usize,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub client_queue: usize,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub history_limit: usize,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub client_queue: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            client_queue: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub addr: String,
    pub debug: bool,
    pub log_dir: String,
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub supervisor: SupervisorConfig,
}

pub fn load_config() -> HubConfig {
    HubConfig::from_args(Args::parse())
}

impl HubConfig {
    pub fn from_args(args: Args) -> Self {
        let store = StoreConfig {
            dir: PathBuf::from(resolve_value(
                &args.data_dir,
                &["WOOAGENT_DATA_DIR"],
                DEFAULT_DATA_DIR,
            )),
            recent_capacity: args.recent_capacity.max(1),
        };
        let supervisor = SupervisorConfig {
            agent_path: PathBuf::from(resolve_value(
                &args.agent_path,
                &["AGENT_PATH"],
                DEFAULT_AGENT_PATH,
            )),
            entrypoint: args.agent_entrypoint.clone(),
            program: resolve_value(&args.agent_program, &["AGENT_PYTHON"], DEFAULT_PROGRAM),
            agent_port: resolve_agent_port(args.agent_port),
            model_name: resolve_value(&args.model_name, &["AGENT_MODEL"], DEFAULT_MODEL_NAME),
            warmup: Duration::from_millis(args.warmup_ms),
            settle: Duration::from_millis(args.settle_ms),
            stop_timeout: Duration::from_millis(args.stop_timeout_ms),
            bridge_timeout: Duration::from_secs(args.bridge_timeout_secs.max(1)),
            ..SupervisorConfig::default()
        };
        Self {
            addr: resolve_addr(&args.addr),
            debug: args.debug || env_true("WOOAGENT_DEBUG"),
            log_dir: resolve_value(&args.log_dir, &["WOOAGENT_LOG_DIR"], DEFAULT_LOG_DIR),
            gateway: GatewayConfig {
                history_limit: args.history_limit,
                ping_interval: Duration::from_secs(args.ping_interval),
                write_timeout: Duration::from_secs(args.write_timeout.max(1)),
                client_queue: args.client_queue.max(8),
            },
            store,
            supervisor,
        }
    }
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Flag first, then the listed env vars in order, then `default`.
fn resolve_value(flag: &str, keys: &[&str], default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    keys.iter()
        .find_map(|key| env_value(key))
        .unwrap_or_else(|| default.to_string())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Some(value) = env_value("WOOAGENT_ADDR") {
        return value;
    }
    if let Some(addr) = env_value("PORT").and_then(|port| addr_from_port(&port)) {
        return addr;
    }
    DEFAULT_ADDR.to_string()
}

fn addr_from_port(port: &str) -> Option<String> {
    port.trim()
        .parse::<u16>()
        .ok()
        .map(|port| format!("127.0.0.1:{port}"))
}

fn resolve_agent_port(flag: Option<u16>) -> u16 {
    flag.or_else(|| env_value("AGENT_PORT").and_then(|value| value.trim().parse().ok()))
        .unwrap_or(DEFAULT_AGENT_PORT)
}
