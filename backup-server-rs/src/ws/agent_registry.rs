use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::models::client;
use crate::state::AppState;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct AgentConnection {
    pub client_name: String,
    pub version: String,
    pub tx: mpsc::UnboundedSender<String>,
}

/// `backup:*` message received from a client's agent.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub client_name: String,
    pub event_type: String,
    pub payload: Value,
}

pub struct AgentRegistry {
    agents: DashMap<String, AgentConnection>,
    events: broadcast::Sender<AgentEvent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            agents: DashMap::new(),
            events,
        }
    }

    pub fn register(&self, client_name: String, version: String, tx: mpsc::UnboundedSender<String>) {
        // Replacing the entry drops the old sender, which ends the old socket's writer
        self.agents.insert(
            client_name.clone(),
            AgentConnection { client_name, version, tx },
        );
    }

    /// Only removes the entry if it still belongs to the closing socket.
    pub fn unregister(&self, client_name: &str, tx: &mpsc::UnboundedSender<String>) {
        self.agents
            .remove_if(client_name, |_, conn| conn.tx.same_channel(tx));
    }

    pub fn is_connected(&self, client_name: &str) -> bool {
        self.agents.contains_key(client_name)
    }

    pub fn connected(&self) -> Vec<(String, String)> {
        self.agents
            .iter()
            .map(|entry| (entry.client_name.clone(), entry.version.clone()))
            .collect()
    }

    pub fn send_to_agent(&self, client_name: &str, message: Value) -> bool {
        self.agents
            .get(client_name)
            .map(|agent| agent.tx.send(message.to_string()).is_ok())
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn publish_event(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts both `{"type": ..., "payload": ...}` and the externally tagged
/// `{"event": {...}}` shape.
fn split_message(parsed: &Value) -> Option<(String, Value)> {
    if let Some(t) = parsed.get("type").and_then(|t| t.as_str()) {
        return Some((t.to_string(), parsed.get("payload").cloned().unwrap_or_default()));
    }
    let obj = parsed.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.iter().next().map(|(k, v)| (k.clone(), v.clone()))
}

/// Client name from an `agent:register` payload, if it is usable.
fn registration_name(payload: &Value) -> Result<String, String> {
    let name = payload.get("client_name").and_then(|v| v.as_str()).unwrap_or("");
    if name.is_empty() {
        return Err("client_name is required".into());
    }
    client::validate_name(name).map_err(|e| e.to_string())?;
    Ok(name.to_string())
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut client_name: Option<String> = None;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some((msg_type, payload)) = split_message(&parsed) else {
            continue;
        };

        match msg_type.as_str() {
            "agent:register" => {
                let version = payload.get("version").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let name = match registration_name(&payload) {
                    Ok(name) => name,
                    Err(e) => {
                        tracing::warn!("Agent registration refused: {}", e);
                        let err_msg = serde_json::json!({
                            "type": "agent:register:error",
                            "payload": { "error": e }
                        });
                        let _ = tx.send(err_msg.to_string());
                        continue;
                    }
                };

                let db = state.db.clone();
                let name2 = name.clone();
                let registered = tokio::task::spawn_blocking(move || {
                    let conn = db.get()?;
                    client::find_or_create(&conn, &name2)
                })
                .await;

                let registered = match registered {
                    Ok(Ok(c)) => c,
                    Ok(Err(e)) => {
                        tracing::warn!(client = %name, "Agent registration failed: {:#}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(client = %name, "Agent registration task failed: {}", e);
                        continue;
                    }
                };

                tracing::info!(client = %name, client_id = registered.id, version = %version, "Agent registered");
                state.agents.register(name.clone(), version, tx.clone());
                if state.status().get(&name).is_none() {
                    state.status().reset(&name);
                }
                client_name = Some(name.clone());

                let ok_msg = serde_json::json!({
                    "type": "agent:register:ok",
                    "payload": { "client_name": name, "client_id": registered.id }
                });
                let _ = tx.send(ok_msg.to_string());
            }
            t if t.starts_with("backup:") => {
                let Some(name) = &client_name else {
                    continue;
                };
                state.agents.publish_event(AgentEvent {
                    client_name: name.clone(),
                    event_type: msg_type,
                    payload,
                });
            }
            _ => {}
        }
    }

    if let Some(name) = &client_name {
        tracing::info!(client = %name, "Agent disconnected");
        state.agents.unregister(name, &tx);
    }

    send_task.abort();
}
