//! WebSocket telemetry fan-out.
//!
//! Connections receive one `{"type":"init", ...}` snapshot, then every state
//! event in emission order. A dedicated broadcaster task drains the State
//! Store's bounded event queue at ~20 Hz and pushes each event to every
//! registered client; clients whose channel is gone are pruned in the same
//! pass. Each connection handles its own 30-second keepalive and
//! `ping`/`pong` exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::defaults::{BROADCAST_INTERVAL_MS, WS_KEEPALIVE_SECS};
use crate::state::StateStore;
use crate::types::{unix_now, StateEvent};

use super::handlers::ApiState;

struct Client {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// Shared set of connected dashboard clients.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<Mutex<Vec<Client>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.clients.lock() {
            clients.push(Client { id, tx });
        }
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain(|c| c.id != id);
        }
    }

    /// Push one serialized event to every client, pruning dead ones.
    pub fn broadcast(&self, payload: &str) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain(|client| client.tx.send(payload.to_string()).is_ok());
        }
    }
}

/// Drain the state event queue at ~20 Hz and fan events out.
pub async fn run_broadcaster(
    store: Arc<StateStore>,
    registry: ClientRegistry,
    cancel: CancellationToken,
) {
    let Some(mut events) = store.take_event_receiver() else {
        debug!("Event queue already taken, broadcaster idle");
        return;
    };
    let mut tick = tokio::time::interval(Duration::from_millis(BROADCAST_INTERVAL_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                while let Ok(event) = events.try_recv() {
                    if let Ok(payload) = serde_json::to_string(&event) {
                        registry.broadcast(&payload);
                    }
                }
            }
        }
    }
    debug!("Broadcaster stopped");
}

/// `GET /ws/telemetry` — WebSocket upgrade for dashboards.
pub async fn ws_handler(
    State(state): State<ApiState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ApiState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Full snapshot first, so the dashboard renders before the next event.
    let init = json!({ "type": "init", "data": state.store.full_state() }).to_string();
    if ws_tx.send(Message::Text(init)).await.is_err() {
        return;
    }

    let (client_id, mut event_rx) = state.clients.register();
    info!(client = client_id, "Dashboard connected");

    let mut keepalive = tokio::time::interval(Duration::from_secs(WS_KEEPALIVE_SECS));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,

            event = event_rx.recv() => {
                match event {
                    Some(payload) => {
                        if ws_tx.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) {
                            let pong = json!({ "type": "pong", "ts": unix_now() }).to_string();
                            if ws_tx.send(Message::Text(pong)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = keepalive.tick() => {
                let wake = json!({ "type": "keepalive", "ts": unix_now() }).to_string();
                if ws_tx.send(Message::Text(wake)).await.is_err() {
                    break;
                }
            }
        }
    }

    state.clients.unregister(client_id);
    info!(client = client_id, "Dashboard disconnected");
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(str::to_owned)))
        .is_some_and(|t| t == "ping")
}

/// Serialize an event exactly as clients receive it (used by tests).
pub fn event_payload(event: &StateEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateEvent;

    #[test]
    fn registry_prunes_dead_clients() {
        let registry = ClientRegistry::new();
        let (_id, rx) = registry.register();
        let (_id2, rx2) = registry.register();
        assert_eq!(registry.len(), 2);

        drop(rx);
        registry.broadcast("hello");
        assert_eq!(registry.len(), 1);
        drop(rx2);
    }

    #[test]
    fn alert_events_carry_dashboard_shape() {
        let event = StateEvent::AlertChange {
            state: "DANGER".to_string(),
            value: 3,
            reason: "Detected: Fire".to_string(),
        };
        let payload = event_payload(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "alert_change");
        assert_eq!(value["data"]["reason"], "Detected: Fire");
    }

    #[test]
    fn ping_detection() {
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"hello"}"#));
        assert!(!is_ping("not json"));
    }
}
