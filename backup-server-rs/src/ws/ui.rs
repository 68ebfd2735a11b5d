use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::services::status_registry::ClientStatus;
use crate::state::AppState;

pub fn status_message(status: &ClientStatus) -> Value {
    json!({
        "type": "status:changed",
        "payload": status,
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before the snapshot so no change falls between the two
    let mut rx = state.status().subscribe();
    let snapshot = state.status().all();
    let status = state.status().clone();

    let send_task = tokio::spawn(async move {
        for s in &snapshot {
            if sender.send(Message::Text(status_message(s).to_string().into())).await.is_err() {
                return;
            }
        }
        loop {
            let change = match rx.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(n)) => {
                    // Too far behind to replay; resend the current state instead
                    tracing::debug!(skipped = n, "Status stream lagged, resending snapshot");
                    for s in status.all() {
                        if sender.send(Message::Text(status_message(&s).to_string().into())).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
                Err(RecvError::Closed) => return,
            };
            if sender.send(Message::Text(status_message(&change).to_string().into())).await.is_err() {
                return;
            }
        }
    });

    // The stream is one-way; incoming frames only matter for detecting close
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::status_registry::StatusAction;

    #[test]
    fn test_status_message_shape() {
        let mut status = ClientStatus::idle("pc");
        status.action = StatusAction::IncrImage;
        status.percent_done = 12;

        let msg = status_message(&status);
        assert_eq!(msg["type"], "status:changed");
        assert_eq!(msg["payload"]["client"], "pc");
        assert_eq!(msg["payload"]["action"], "incr_image");
        assert_eq!(msg["payload"]["percent_done"], 12);
    }
}
