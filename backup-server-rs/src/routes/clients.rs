use crate::error::AppError;
use crate::models::backup_job::{BackupKind, BackupMode, LoggingPolicy, RunTrigger};
use crate::models::backup_log::{self, BackupLog};
use crate::models::client::{self, Client};
use crate::services::client_queue::BackupRequest;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 500;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_clients))
        .route("/{client}/backups", post(start_backup))
        .route("/{client}/logs", get(list_logs))
}

#[derive(Debug, Serialize)]
pub struct ClientView {
    #[serde(flatten)]
    pub client: Client,
    pub agent_connected: bool,
    pub agent_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartBackupBody {
    pub kind: BackupKind,
    pub mode: BackupMode,
    #[serde(default)]
    pub resumed: bool,
    #[serde(default)]
    pub logging: LoggingPolicy,
    /// Requests from the API count as manual unless stated otherwise.
    pub trigger: Option<RunTrigger>,
}

impl From<StartBackupBody> for BackupRequest {
    fn from(body: StartBackupBody) -> Self {
        BackupRequest {
            kind: body.kind,
            mode: body.mode,
            resumed: body.resumed,
            logging: body.logging,
            trigger: body.trigger.unwrap_or(RunTrigger::Manual),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
}

async fn find_client(state: &AppState, name: String) -> Result<Client, AppError> {
    let db = state.db.clone();
    let lookup = name.clone();
    let found = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        client::find_by_name(&conn, &lookup)
    })
    .await??;
    found.ok_or(AppError::UnknownClient(name))
}

async fn list_clients(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ClientView>>, AppError> {
    let db = state.db.clone();
    let clients = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        client::find_all(&conn)
    })
    .await??;

    let agents: HashMap<String, String> = state.agents.connected().into_iter().collect();
    let views = clients
        .into_iter()
        .map(|c| {
            let version = agents.get(&c.name).cloned();
            ClientView {
                agent_connected: version.is_some(),
                agent_version: version,
                client: c,
            }
        })
        .collect();
    Ok(Json(views))
}

async fn start_backup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<StartBackupBody>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let c = find_client(&state, name).await?;
    let request = BackupRequest::from(body);
    tracing::info!(client = %c.name, kind = ?request.kind, mode = ?request.mode, "Backup requested");
    state.enqueue(&c, request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "client": c.name, "queued": true })),
    ))
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<BackupLog>>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    if limit < 1 {
        return Err(AppError::BadRequest("limit must be at least 1".into()));
    }
    let limit = limit.min(MAX_LOG_LIMIT);
    let c = find_client(&state, name).await?;
    let db = state.db.clone();
    let logs = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_log::find_by_client_id(&conn, c.id, limit)
    })
    .await??;
    Ok(Json(logs))
}
