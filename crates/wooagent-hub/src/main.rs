use std::net::SocketAddr;
use tracing::{error, info, warn};
use wooagent_hub::config::load_config;
use wooagent_hub::logging::init_logging;
use wooagent_hub::Hub;

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_addr", addr = %config.addr);
    }

    let hub = match Hub::init(config.clone()) {
        Ok(hub) => hub,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            hub.shutdown().await;
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        agent_port = config.supervisor.agent_port
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, hub.router())
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    hub.shutdown().await;
}
