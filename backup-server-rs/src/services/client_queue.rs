//! Per-client controller: queues backup requests and starts the next one
//! once the running job signals that it has ended.

use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::models::backup_job::{BackupJob, BackupKind, BackupMode, LoggingPolicy, RunTrigger};
use crate::models::client::Client;
use crate::services::backup_runner::{BackupEngine, BackupRunner, RunServices};

#[derive(Debug, Clone, Deserialize)]
pub struct BackupRequest {
    pub kind: BackupKind,
    pub mode: BackupMode,
    #[serde(default)]
    pub resumed: bool,
    #[serde(default)]
    pub logging: LoggingPolicy,
    #[serde(default)]
    pub trigger: RunTrigger,
}

impl BackupRequest {
    fn into_job(self, client: &Client) -> BackupJob {
        BackupJob::new(client.id, client.name.clone(), self.kind, self.mode)
            .resumed(self.resumed)
            .logging(self.logging)
            .trigger(self.trigger)
    }
}

#[derive(Clone)]
pub struct ClientQueue {
    tx: mpsc::UnboundedSender<BackupRequest>,
}

impl ClientQueue {
    pub fn spawn(
        client: Client,
        services: Arc<RunServices>,
        engine: Arc<dyn BackupEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(client, services, engine, rx, cancel));
        Self { tx }
    }

    /// Returns false once the queue's task has stopped.
    pub fn enqueue(&self, request: BackupRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

async fn drive(
    client: Client,
    services: Arc<RunServices>,
    engine: Arc<dyn BackupEngine>,
    mut rx: mpsc::UnboundedReceiver<BackupRequest>,
    cancel: CancellationToken,
) {
    let wakeup = Arc::new(Notify::new());
    let mut pending: VecDeque<BackupRequest> = VecDeque::new();
    let mut running = false;
    let mut closed = false;

    loop {
        if !running {
            if let Some(request) = pending.pop_front() {
                let job = request.into_job(&client);
                tracing::info!(client = %client.name, run_id = %job.run_id, queued = pending.len(), "Starting queued backup");
                let runner = BackupRunner::new(services.clone(), engine.clone(), job, wakeup.clone());
                tokio::spawn(runner.run());
                running = true;
            } else if closed {
                break;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv(), if !closed => match request {
                Some(request) => pending.push_back(request),
                None => closed = true,
            },
            _ = wakeup.notified(), if running => running = false,
        }
    }

    tracing::debug!(client = %client.name, dropped = pending.len(), "Client queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::connection::test_pool;
    use crate::models::client;
    use crate::services::report_mailer::testing::RecordingTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Blocks each run until released, tracking overlap.
    struct GateEngine {
        gate: Notify,
        active: AtomicUsize,
        max_active: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl BackupEngine for GateEngine {
        async fn run(&self, _job: &mut BackupJob) -> bool {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.gate.notified().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn request() -> BackupRequest {
        BackupRequest {
            kind: BackupKind::File,
            mode: BackupMode::Incremental,
            resumed: false,
            logging: LoggingPolicy::Never,
            trigger: RunTrigger::Manual,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_runs_one_at_a_time_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let config = AppConfig::for_tests(dir.path());
        let c = {
            let conn = pool.get().unwrap();
            client::find_or_create(&conn, "pc").unwrap()
        };
        let services = Arc::new(RunServices::new(pool, &config, Arc::new(RecordingTransport::default())));
        let engine = Arc::new(GateEngine {
            gate: Notify::new(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let queue = ClientQueue::spawn(c, services.clone(), engine.clone(), cancel.clone());

        assert!(queue.enqueue(request()));
        assert!(queue.enqueue(request()));

        for expected in 1..=2 {
            wait_until(|| engine.active.load(Ordering::SeqCst) == 1).await;
            engine.gate.notify_one();
            wait_until(|| engine.finished.load(Ordering::SeqCst) == expected).await;
        }

        assert_eq!(engine.max_active.load(Ordering::SeqCst), 1);
        wait_until(|| services.status.get("pc").map(|s| s.is_idle()).unwrap_or(false)).await;

        cancel.cancel();
        wait_until(|| !queue.enqueue(request())).await;
    }
}
