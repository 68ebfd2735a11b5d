use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::error::AppError;
use crate::models::client::Client;
use crate::services::agent_engine::AgentEngine;
use crate::services::backup_runner::{BackupEngine, RunServices};
use crate::services::client_queue::{BackupRequest, ClientQueue};
use crate::services::report_mailer::MailTransport;
use crate::services::stats::StatsRefresher;
use crate::services::status_registry::StatusRegistry;
use crate::ws::agent_registry::AgentRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub services: Arc<RunServices>,
    pub agents: Arc<AgentRegistry>,
    pub engine: Arc<dyn BackupEngine>,
    pub queues: DashMap<String, ClientQueue>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, transport: Arc<dyn MailTransport>) -> Self {
        let services = Arc::new(RunServices::new(db.clone(), &config, transport));
        let agents = Arc::new(AgentRegistry::new());
        let engine = Arc::new(AgentEngine::new(
            agents.clone(),
            services.status.clone(),
            services.logs.clone(),
        ));
        Self::assemble(db, config, services, agents, engine)
    }

    #[cfg(test)]
    pub fn with_engine(
        db: DbPool,
        config: AppConfig,
        transport: Arc<dyn MailTransport>,
        make_engine: impl FnOnce(&RunServices) -> Arc<dyn BackupEngine>,
    ) -> Self {
        let services = Arc::new(RunServices::new(db.clone(), &config, transport));
        let engine = make_engine(&services);
        Self::assemble(db, config, services, Arc::new(AgentRegistry::new()), engine)
    }

    fn assemble(
        db: DbPool,
        config: AppConfig,
        services: Arc<RunServices>,
        agents: Arc<AgentRegistry>,
        engine: Arc<dyn BackupEngine>,
    ) -> Self {
        Self {
            db,
            config,
            services,
            agents,
            engine,
            queues: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.services.status
    }

    pub fn stats(&self) -> &Arc<StatsRefresher> {
        &self.services.stats
    }

    /// Hands the request to the client's queue, starting the queue on first use.
    pub fn enqueue(&self, client: &Client, request: BackupRequest) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::QueueClosed(client.name.clone()));
        }

        let mut queue = self
            .queues
            .entry(client.name.clone())
            .or_insert_with(|| self.spawn_queue(client));
        if queue.enqueue(request.clone()) {
            return Ok(());
        }

        // The previous queue task is gone; replace it once
        *queue = self.spawn_queue(client);
        if queue.enqueue(request) {
            Ok(())
        } else {
            Err(AppError::QueueClosed(client.name.clone()))
        }
    }

    fn spawn_queue(&self, client: &Client) -> ClientQueue {
        tracing::debug!(client = %client.name, "Starting backup queue");
        ClientQueue::spawn(
            client.clone(),
            self.services.clone(),
            self.engine.clone(),
            self.cancel.child_token(),
        )
    }
}
