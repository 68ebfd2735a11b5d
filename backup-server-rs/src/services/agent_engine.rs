//! Backup engine that delegates the transfer to the client's connected agent.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::models::backup_job::{BackupJob, BackupKind};
use crate::services::backup_runner::BackupEngine;
use crate::services::client_log::{ClientLogger, Severity};
use crate::services::status_registry::StatusRegistry;
use crate::ws::agent_registry::{AgentEvent, AgentRegistry};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct AgentEngine {
    agents: Arc<AgentRegistry>,
    status: Arc<StatusRegistry>,
    logs: Arc<ClientLogger>,
}

enum Step {
    Continue,
    Done(bool),
}

impl AgentEngine {
    pub fn new(agents: Arc<AgentRegistry>, status: Arc<StatusRegistry>, logs: Arc<ClientLogger>) -> Self {
        Self { agents, status, logs }
    }

    fn handle_event(&self, job: &BackupJob, event: AgentEvent) -> Step {
        if event.client_name != job.client_name {
            return Step::Continue;
        }
        let run_id = job.run_id.to_string();
        if event.payload.get("run_id").and_then(Value::as_str) != Some(run_id.as_str()) {
            return Step::Continue;
        }

        let payload = &event.payload;
        match event.event_type.as_str() {
            "backup:progress" => {
                let int = |key: &str| payload.get(key).and_then(Value::as_i64);
                self.status.update(&job.client_name, |s| {
                    if let Some(pc) = int("percent") {
                        s.percent_done = pc.clamp(-1, 100) as i32;
                    }
                    if let Some(n) = int("hash_queue_size") {
                        s.hash_queue_size = n.max(0) as u64;
                    }
                    if let Some(n) = int("prepare_hash_queue_size") {
                        s.prepare_hash_queue_size = n.max(0) as u64;
                    }
                });
                Step::Continue
            }
            "backup:log" => {
                let severity = payload
                    .get("level")
                    .and_then(Value::as_i64)
                    .and_then(Severity::from_code)
                    .unwrap_or(Severity::Info);
                let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
                match payload.get("time").and_then(Value::as_i64) {
                    Some(ts) => self.logs.log_at(job.client_id, message, severity, ts),
                    None => self.logs.log(job.client_id, message, severity),
                }
                Step::Continue
            }
            "backup:completed" => Step::Done(true),
            "backup:failed" => {
                let error = payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Backup failed on client");
                self.logs.log(job.client_id, error, Severity::Error);
                Step::Done(false)
            }
            _ => Step::Continue,
        }
    }
}

#[async_trait]
impl BackupEngine for AgentEngine {
    fn notify_start(&self, client: &str, kind: BackupKind) {
        tracing::debug!(client, ?kind, "Agent backup running");
    }

    async fn run(&self, job: &mut BackupJob) -> bool {
        if !self.agents.is_connected(&job.client_name) {
            self.logs.log(job.client_id, "Client agent is not connected", Severity::Error);
            job.early_error = true;
            return false;
        }

        // Subscribe before starting so no completion event can slip past
        let mut events = self.agents.subscribe();
        let sent = self.agents.send_to_agent(
            &job.client_name,
            json!({
                "type": "backup:start",
                "payload": {
                    "run_id": job.run_id.to_string(),
                    "kind": job.kind,
                    "mode": job.mode,
                    "resumed": job.resumed,
                },
            }),
        );
        if !sent {
            self.logs.log(job.client_id, "Sending backup command to client agent failed", Severity::Error);
            job.early_error = true;
            return false;
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        let mut cancel_sent = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Step::Done(result) = self.handle_event(job, event) {
                            return result;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(client = %job.client_name, skipped = n, "Agent events lagged");
                    }
                    Err(RecvError::Closed) => return false,
                },
                _ = poll.tick() => {
                    if !cancel_sent && self.status.stop_requested(&job.client_name) {
                        self.agents.send_to_agent(&job.client_name, json!({
                            "type": "backup:cancel",
                            "payload": { "run_id": job.run_id.to_string() },
                        }));
                        self.logs.log(job.client_id, "Backup cancelled by request", Severity::Warning);
                        cancel_sent = true;
                    }
                    if !self.agents.is_connected(&job.client_name) {
                        self.logs.log(job.client_id, "Client agent disconnected during backup", Severity::Error);
                        return false;
                    }
                }
            }
        }
    }

    fn notify_stop(&self, client: &str, kind: BackupKind) {
        tracing::debug!(client, ?kind, "Agent backup no longer running");
    }
}
