//! WebSocket feed of queue events.
//!
//! On connect the client gets a `sync` with every open action, then each
//! queue event as it happens. Clients may approve or reject over the same
//! socket; a command that fails gets an `error` frame back on that socket
//! only.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::queue::ApprovalQueue;
use crate::queue::model::{Decision, QueueEvent};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Commands a client can send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Approve { action_id: Uuid },
    Reject { action_id: Uuid },
}

/// Reply to a command that could not be applied.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "error")]
struct CommandError {
    #[serde(skip_serializing_if = "Option::is_none")]
    action_id: Option<Uuid>,
    message: String,
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.queue))
}

async fn send_event(socket: &mut WebSocket, event: &QueueEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize queue event");
            true
        }
    }
}

async fn sync(socket: &mut WebSocket, queue: &ApprovalQueue) -> bool {
    match queue.open().await {
        Ok(actions) => send_event(socket, &QueueEvent::Sync { actions }).await,
        Err(e) => {
            warn!(error = %e, "Failed to load open actions for sync");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, queue: Arc<ApprovalQueue>) {
    info!("WebSocket client connected");

    // Subscribe before the sync so nothing between the two is missed.
    let mut rx = queue.subscribe();

    if !sync(&mut socket, &queue).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !sync(&mut socket, &queue).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if !send_event(&mut socket, &QueueEvent::Ping).await {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(err) = handle_client_message(&text, &queue).await {
                            if !send_error(&mut socket, &err).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn send_error(socket: &mut WebSocket, err: &CommandError) -> bool {
    match serde_json::to_string(err) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize command error");
            true
        }
    }
}

/// Apply one client command. Returns the error to report back, if any.
async fn handle_client_message(text: &str, queue: &ApprovalQueue) -> Option<CommandError> {
    let (action_id, decision) = match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Approve { action_id }) => (action_id, Decision::Approve),
        Ok(ClientCommand::Reject { action_id }) => (action_id, Decision::Reject),
        Err(e) => {
            debug!(error = %e, text, "Unrecognized WS message from client");
            return Some(CommandError {
                action_id: None,
                message: format!("unrecognized command: {e}"),
            });
        }
    };

    // Success is broadcast to every client, this one included.
    match queue.decide(action_id, decision).await {
        Ok(_) => {
            info!(%action_id, ?decision, "Action decided via WS");
            None
        }
        Err(e) => {
            warn!(%action_id, error = %e, "Decision via WS failed");
            Some(CommandError {
                action_id: Some(action_id),
                message: e.to_string(),
            })
        }
    }
}
