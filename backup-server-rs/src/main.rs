mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::models::client;
use crate::services::report_mailer::SmtpTransport;
use crate::state::AppState;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    tracing::info!("Starting backup run server on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    // Build application state
    let transport = Arc::new(SmtpTransport::new());
    let state = Arc::new(AppState::new(pool, config.clone(), transport));
    let cancel = state.cancel.clone();

    // Every known client starts out idle
    let known = {
        let conn = state.db.get()?;
        client::find_all(&conn)?
    };
    for c in &known {
        state.status().reset(&c.name);
    }
    tracing::info!(clients = known.len(), "Status registry initialized");

    let stats_task = state.stats().spawn(state.db.clone(), cancel.clone());

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Err(e) = stats_task.await {
        tracing::warn!("Statistics task ended abnormally: {}", e);
    }

    // Close database
    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {},
    }

    cancel.cancel();
}
