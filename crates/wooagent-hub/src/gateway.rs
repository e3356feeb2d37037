use crate::pipeline::{ClientId, PipelineHandle};
use crate::AppState;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};
use wooagent_core::wire::{encode_event, parse_client_request, ServerEvent};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Deregisters the subscriber however the connection ends.
struct DetachGuard {
    pipeline: PipelineHandle,
    client_id: ClientId,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.pipeline.detach(self.client_id);
    }
}

pub async fn handle_socket(state: AppState, socket: WebSocket) {
    let config = state.gateway.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(config.client_queue);
    let write_timeout = config.write_timeout;
    let mut ticker = ping_ticker(config.ping_interval);
    let write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => Message::Text(text),
                    None => break,
                },
                _ = tick(&mut ticker) => Message::Ping(Vec::new()),
            };
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "write_error", error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout");
                    return;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    // The pipeline holds the only strong sender, so eviction ends the writer.
    let weak_tx = tx.downgrade();
    let client_id = match state.pipeline.attach(tx, config.history_limit).await {
        Ok(client_id) => client_id,
        Err(err) => {
            warn!(event = "subscriber_attach_failed", error = %err);
            let _ = write_task.await;
            return;
        }
    };
    let guard = DetachGuard {
        pipeline: state.pipeline.clone(),
        client_id,
    };
    info!(event = "client_connected", client_id);

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", client_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "client_close", client_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match parse_client_request(&data) {
            Ok(request) => state.pipeline.pull(client_id, request),
            Err(err) => {
                warn!(event = "client_request_invalid", client_id, error = %err);
                let Some(tx) = weak_tx.upgrade() else {
                    break;
                };
                let Ok(frame) = encode_event(&ServerEvent::error(err.to_string())) else {
                    continue;
                };
                if tx.try_send(frame).is_err() {
                    break;
                }
            }
        }
    }

    drop(guard);
    let _ = write_task.await;
    info!(event = "client_disconnected", client_id);
}

fn ping_ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::time::interval_at(Instant::now() + interval, interval))
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
