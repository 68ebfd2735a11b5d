use crate::error::AppError;
use crate::models::backup_log::{self, BackupLog};
use crate::services::client_log::LogEntry;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{id}", get(get_log))
}

#[derive(Debug, Serialize)]
pub struct LogDetail {
    #[serde(flatten)]
    pub log: BackupLog,
    pub entries: Vec<LogEntry>,
}

fn parse_entries(log_id: i64, logdata: &str) -> Vec<LogEntry> {
    logdata
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| match LogEntry::parse_line(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(log_id, "Skipping malformed log line: {}", e);
                None
            }
        })
        .collect()
}

async fn get_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<LogDetail>, AppError> {
    let db = state.db.clone();
    let found = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let Some(log) = backup_log::find_by_id(&conn, id)? else {
            return Ok::<_, anyhow::Error>(None);
        };
        let data = backup_log::find_data(&conn, id)?.unwrap_or_default();
        Ok(Some((log, data)))
    })
    .await??;

    let (log, data) = found.ok_or_else(|| AppError::NotFound(format!("Backup log {id} not found")))?;
    let entries = parse_entries(id, &data);
    Ok(Json(LogDetail { log, entries }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::client_log::Severity;

    #[test]
    fn test_parse_entries_skips_bad_lines() {
        let entries = parse_entries(1, "0-10-started\ngarbage\n\n2-12-disk-full");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].severity, Severity::Error);
        assert_eq!(entries[1].message, "disk-full");
    }
}
