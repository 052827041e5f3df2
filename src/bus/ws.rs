//! Per-connection WebSocket fan-out: batches low-priority events on a
//! 100ms tick, flushes `task_update`/`agent_status`/`cli_output` instantly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::broadcast;
use tokio::time;

use super::event_bus::{BusEvent, WireFrame};
use super::event_types::{should_flush_immediately, EVENT_CONNECTED};
use super::EventBus;

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const MAX_BATCH: usize = 50;

pub async fn handle_socket(mut socket: WebSocket, bus: Arc<EventBus>) {
    let connected = serde_json::json!({ "version": env!("CARGO_PKG_VERSION"), "app": "climpire" });
    let frame = serde_json::json!({ "type": EVENT_CONNECTED, "payload": connected, "ts": chrono::Utc::now().timestamp_millis() });
    if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
        return;
    }

    let mut rx = bus.subscribe();
    let mut buffer: Vec<BusEvent> = Vec::with_capacity(MAX_BATCH);
    let mut interval = time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Clients don't send us anything meaningful; ignore pings/binary/text.
                    Some(Ok(_)) => {}
                }
            }
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if should_flush_immediately(&event) {
                            if !buffer.is_empty() && !flush(&mut socket, &mut buffer).await {
                                break;
                            }
                            if !send_one(&mut socket, &event).await {
                                break;
                            }
                        } else {
                            buffer.push(event);
                            if buffer.len() >= MAX_BATCH && !flush(&mut socket, &mut buffer).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("websocket subscriber lagged, dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() && !flush(&mut socket, &mut buffer).await {
                    break;
                }
            }
        }
    }
}

async fn send_one(socket: &mut WebSocket, event: &BusEvent) -> bool {
    let wire = WireFrame::from(event);
    match serde_json::to_string(&wire) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!("failed to serialize event for websocket: {e}");
            true
        }
    }
}

async fn flush(socket: &mut WebSocket, buffer: &mut Vec<BusEvent>) -> bool {
    for event in buffer.drain(..) {
        let wire = WireFrame::from(&event);
        let Ok(text) = serde_json::to_string(&wire) else {
            continue;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            return false;
        }
    }
    true
}
