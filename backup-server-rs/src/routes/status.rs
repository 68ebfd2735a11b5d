use crate::error::AppError;
use crate::services::stats::StatsSnapshot;
use crate::services::status_registry::ClientStatus;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_status))
        .route("/{client}", get(get_status))
        .route("/{client}/stop", post(request_stop))
}

async fn list_status(State(state): State<Arc<AppState>>) -> Json<Vec<ClientStatus>> {
    Json(state.status().all())
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(client): Path<String>,
) -> Result<Json<ClientStatus>, AppError> {
    state
        .status()
        .get(&client)
        .map(Json)
        .ok_or(AppError::UnknownClient(client))
}

/// Cooperative: the engine decides when it notices the flag.
async fn request_stop(
    State(state): State<Arc<AppState>>,
    Path(client): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let Some(current) = state.status().get(&client) else {
        return Err(AppError::UnknownClient(client));
    };
    state.status().signal_stop_requested(&client, true);
    tracing::info!(client = %client, running = !current.is_idle(), "Stop requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "client": client, "running": !current.is_idle() })),
    ))
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.stats().snapshot().await)
}
