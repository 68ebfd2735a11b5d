pub mod clients;
pub mod logs;
pub mod status;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/status", status::router())
        .nest("/api/clients", clients::router())
        .nest("/api/logs", logs::router())
        .route("/api/stats", get(status::get_stats))
        .route("/ws", get(crate::ws::ui::ws_handler))
        .route("/ws/agent", get(crate::ws::agent_registry::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::connection::test_pool;
    use crate::models::client;
    use crate::services::backup_runner::testing::FakeEngine;
    use crate::services::client_log::Severity;
    use crate::services::report_mailer::testing::RecordingTransport;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        _dir: TempDir,
        state: Arc<AppState>,
        app: Router,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let pool = test_pool(dir.path());
            {
                let conn = pool.get().unwrap();
                client::find_or_create(&conn, "pc").unwrap();
            }
            let state = Arc::new(AppState::with_engine(
                pool,
                AppConfig::for_tests(dir.path()),
                Arc::new(RecordingTransport::default()),
                |services| {
                    let mut engine = FakeEngine::new(services, true);
                    engine.emit = vec![(Severity::Warning, "slow-disk".into())];
                    Arc::new(engine)
                },
            ));
            state.status().reset("pc");
            let app = create_router(state.clone());
            Self { _dir: dir, state, app }
        }

        async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            let body = match body {
                Some(v) => {
                    req = req.header("content-type", "application/json");
                    Body::from(v.to_string())
                }
                None => Body::empty(),
            };
            let resp = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
            let status = resp.status();
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let h = Harness::new();

        let (code, body) = h.call(Method::GET, "/api/status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body[0]["client"], "pc");
        assert_eq!(body[0]["action"], "none");
        assert_eq!(body[0]["percent_done"], -1);

        let (code, body) = h.call(Method::GET, "/api/status/nobody", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Unknown client \"nobody\"");
    }

    #[tokio::test]
    async fn test_stop_request_sets_flag() {
        let h = Harness::new();

        let (code, body) = h.call(Method::POST, "/api/status/pc/stop", None).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(body["running"], false);
        assert!(h.state.status().stop_requested("pc"));

        let (code, _) = h.call(Method::POST, "/api/status/nobody/stop", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(!h.state.status().stop_requested("nobody"));
    }

    #[tokio::test]
    async fn test_backup_request_runs_and_lands_in_history() {
        let h = Harness::new();

        let (code, body) = h
            .call(
                Method::POST,
                "/api/clients/pc/backups",
                Some(json!({ "kind": "file", "mode": "incremental" })),
            )
            .await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(body["queued"], true);

        let mut logs = Value::Null;
        for _ in 0..100 {
            let (_, body) = h.call(Method::GET, "/api/clients/pc/logs", None).await;
            if body.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
                logs = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(logs[0]["warnings"], 1);
        assert_eq!(logs[0]["incremental"], true);
        // Manual runs don't trigger a statistics refresh
        assert_eq!(h.state.stats().requested(), 0);

        let id = logs[0]["id"].as_i64().unwrap();
        let (code, detail) = h.call(Method::GET, &format!("/api/logs/{id}"), None).await;
        assert_eq!(code, StatusCode::OK);
        let entries = detail["entries"].as_array().unwrap();
        assert_eq!(entries[0]["severity"], "warning");
        assert_eq!(entries[0]["message"], "slow-disk");
        assert!(entries.iter().any(|e| e["message"] == "Backup succeeded"));
    }

    #[tokio::test]
    async fn test_client_errors() {
        let h = Harness::new();

        let (code, _) = h
            .call(
                Method::POST,
                "/api/clients/nobody/backups",
                Some(json!({ "kind": "image", "mode": "full" })),
            )
            .await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = h.call(Method::GET, "/api/clients/pc/logs?limit=0", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = h.call(Method::GET, "/api/logs/999", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, body) = h.call(Method::GET, "/api/clients", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body[0]["name"], "pc");
        assert_eq!(body[0]["agent_connected"], false);

        let (code, body) = h.call(Method::GET, "/api/stats", None).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body["clients"].is_array());
        assert_eq!(body["refresh_requests"], 0);
    }
}
