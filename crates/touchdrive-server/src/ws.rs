//! WebSocket handler for live event push
//!
//! Clients connect to /api/v1/ws, get the recent events once, then every
//! newly logged event as it arrives.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use touchdrive_core::ProductionEvent;

/// Events sent on connect
const INITIAL_EVENTS: usize = 50;

/// Message pushed to WebSocket clients
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage<'a> {
    Snapshot {
        events: &'a [ProductionEvent],
        recording: bool,
    },
    Event {
        event: &'a ProductionEvent,
    },
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Subscribe before the snapshot so nothing falls in between
    let mut rx = state.ws_tx.subscribe();

    let events = state.sessions.recent(INITIAL_EVENTS);
    let snapshot = WsMessage::Snapshot {
        events: &events,
        recording: state.sessions.is_recording(),
    };
    if let Ok(json) = serde_json::to_string(&snapshot) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "WebSocket client lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Incoming messages are only pings and close
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("WebSocket client disconnected");
}

/// Serialize one logged event for the broadcast channel
pub fn event_json(event: &ProductionEvent) -> Option<String> {
    serde_json::to_string(&WsMessage::Event { event }).ok()
}

/// Forward every logged event to connected WebSocket clients
pub fn spawn_event_forwarder(state: &AppState) -> tokio::task::JoinHandle<()> {
    let mut events = state.sessions.subscribe();
    let ws_tx = state.ws_tx.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if ws_tx.receiver_count() == 0 {
                        continue;
                    }
                    if let Some(json) = event_json(&event) {
                        let _ = ws_tx.send(json);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event forwarder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
