//! Background refresh of per-client history statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::connection::DbPool;
use crate::models::backup_log::{self, ClientHistoryStats};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub refreshed_at: Option<String>,
    /// Refresh triggers received since startup.
    pub refresh_requests: u64,
    pub clients: Vec<ClientHistoryStats>,
}

pub struct StatsRefresher {
    wake: Notify,
    requested: AtomicU64,
    snapshot: RwLock<StatsSnapshot>,
}

impl StatsRefresher {
    pub fn new() -> Self {
        Self {
            wake: Notify::new(),
            requested: AtomicU64::new(0),
            snapshot: RwLock::new(StatsSnapshot::default()),
        }
    }

    /// Fire and forget. Triggers arriving during a refresh fold into one more pass.
    pub fn trigger(&self) {
        self.requested.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let mut snap = self.snapshot.read().await.clone();
        snap.refresh_requests = self.requested();
        snap
    }

    pub async fn refresh(&self, db: &DbPool) -> anyhow::Result<()> {
        let db = db.clone();
        let clients = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_log::aggregate_by_client(&conn)
        })
        .await??;

        let count = clients.len();
        *self.snapshot.write().await = StatsSnapshot {
            refreshed_at: Some(chrono::Utc::now().to_rfc3339()),
            refresh_requests: 0,
            clients,
        };
        tracing::debug!(clients = count, "Statistics refreshed");
        Ok(())
    }

    pub fn spawn(self: &Arc<Self>, db: DbPool, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.refresh(&db).await {
                tracing::warn!("Initial statistics refresh failed: {:#}", e);
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = this.wake.notified() => {
                        if let Err(e) = this.refresh(&db).await {
                            tracing::warn!("Statistics refresh failed: {:#}", e);
                        }
                    }
                }
            }
        })
    }
}

impl Default for StatsRefresher {
    fn default() -> Self {
        Self::new()
    }
}
