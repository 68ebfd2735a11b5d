//! Lifecycle of a single backup run.
//!
//! classify -> publish status -> prepare client folder -> engine -> log
//! -> persist + report -> idle status -> wake the client's queue.
//!
//! The runner never fails outward: the engine's verdict is the only result,
//! everything else ends up in the client log or the process log.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::models::backup_job::{BackupJob, BackupKind, RunTrigger};
use crate::models::backup_log::{self, CreateLogData};
use crate::models::settings::ServerSettings;
use crate::services::client_log::{ClientLogger, Severity};
use crate::services::report_mailer::{MailTransport, ReportDispatcher, RunReport};
use crate::services::stats::StatsRefresher;
use crate::services::status_registry::{ClientStatus, StatusRegistry};

/// Does the actual data transfer for a run.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    fn notify_start(&self, _client: &str, _kind: BackupKind) {}

    /// Runs the transfer. May flag `early_error` or `suppress_log` on the job.
    async fn run(&self, job: &mut BackupJob) -> bool;

    fn notify_stop(&self, _client: &str, _kind: BackupKind) {}
}

/// Process-wide collaborators every run uses.
pub struct RunServices {
    pub db: DbPool,
    pub default_backup_folder: std::path::PathBuf,
    pub status: Arc<StatusRegistry>,
    pub logs: Arc<ClientLogger>,
    pub reports: ReportDispatcher,
    pub stats: Arc<StatsRefresher>,
}

impl RunServices {
    pub fn new(db: DbPool, config: &AppConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            reports: ReportDispatcher::new(db.clone(), transport),
            db,
            default_backup_folder: config.backups_dir.clone(),
            status: Arc::new(StatusRegistry::new()),
            logs: Arc::new(ClientLogger::new()),
            stats: Arc::new(StatsRefresher::new()),
        }
    }
}

/// Per-run resources. Dropping it puts the client back to idle, releases the
/// settings snapshot and wakes the client's queue, on every exit path.
struct RunScope {
    status: Arc<StatusRegistry>,
    client_name: String,
    settings: Option<ServerSettings>,
    on_done: Arc<Notify>,
}

impl RunScope {
    fn settings(&self) -> Option<&ServerSettings> {
        self.settings.as_ref()
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        self.status.reset(&self.client_name);
        self.settings.take();
        self.on_done.notify_one();
    }
}

pub struct BackupRunner {
    services: Arc<RunServices>,
    engine: Arc<dyn BackupEngine>,
    job: BackupJob,
    on_done: Arc<Notify>,
}

impl BackupRunner {
    pub fn new(
        services: Arc<RunServices>,
        engine: Arc<dyn BackupEngine>,
        job: BackupJob,
        on_done: Arc<Notify>,
    ) -> Self {
        Self {
            services,
            engine,
            job,
            on_done,
        }
    }

    pub async fn run(self) -> bool {
        let span = tracing::info_span!(
            "backup_run",
            client = %self.job.client_name,
            run_id = %self.job.run_id,
        );
        self.execute().instrument(span).await
    }

    async fn execute(self) -> bool {
        let BackupRunner {
            services,
            engine,
            mut job,
            on_done,
        } = self;

        let mut scope = RunScope {
            status: services.status.clone(),
            client_name: job.client_name.clone(),
            settings: None,
            on_done,
        };
        scope.settings = Some(load_settings(&services).await);

        if job.logging_enabled() {
            services.logs.reset(job.client_id);
        }

        services.status.publish(ClientStatus {
            client: job.client_name.clone(),
            action: job.status_action(),
            percent_done: job.initial_percent(),
            hash_queue_size: 0,
            prepare_hash_queue_size: 0,
        });
        services.status.signal_stop_requested(&job.client_name, false);

        if let Some(settings) = scope.settings() {
            match settings.client_folder(&job.client_name) {
                Some(folder) => {
                    create_client_folder(&folder, &job.client_name).await;
                }
                None => tracing::error!(
                    "Refusing to create a directory for client \"{}\": name is not a plain folder name",
                    job.client_name
                ),
            }
        }

        tracing::info!(kind = ?job.kind, mode = ?job.mode, resumed = job.resumed, "Backup started");
        let started = Instant::now();
        job.started_at = Some(chrono::Utc::now());

        engine.notify_start(&job.client_name, job.kind);
        job.result = engine.run(&mut job).await;
        engine.notify_stop(&job.client_name, job.kind);

        if !job.early_error && job.logging_enabled() {
            services.logs.log(
                job.client_id,
                format!(
                    "Time taken for backing up client {}: {}",
                    job.client_name,
                    pretty_print_duration(started.elapsed())
                ),
                Severity::Info,
            );
            if job.result {
                services.logs.log(job.client_id, "Backup succeeded", Severity::Info);
            } else {
                services.logs.log(job.client_id, "Backup failed", Severity::Error);
            }

            if job.trigger == RunTrigger::Scheduled {
                services.stats.trigger();
            }
        }

        if job.should_persist_log() {
            if let Some(settings) = scope.settings() {
                save_client_logdata(&services, settings, &job).await;
            }
        }

        tracing::info!(result = job.result, early_error = job.early_error, "Backup finished");
        drop(scope);
        job.result
    }
}

async fn load_settings(services: &RunServices) -> ServerSettings {
    let db = services.db.clone();
    let default_folder = services.default_backup_folder.clone();
    let loaded = tokio::task::spawn_blocking({
        let default_folder = default_folder.clone();
        move || {
            let conn = db.get()?;
            ServerSettings::load(&conn, &default_folder)
        }
    })
    .await;

    match loaded {
        Ok(Ok(settings)) => settings,
        Ok(Err(e)) => {
            tracing::warn!("Loading server settings failed, using defaults: {:#}", e);
            ServerSettings::defaults(&default_folder)
        }
        Err(e) => {
            tracing::warn!("Settings task failed, using defaults: {}", e);
            ServerSettings::defaults(&default_folder)
        }
    }
}

/// Best effort; the engine fails on its own if the folder is really unusable.
async fn create_client_folder(path: &Path, client_name: &str) -> bool {
    let Err(e) = tokio::fs::create_dir_all(path).await else {
        return true;
    };
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => true,
        _ => {
            tracing::error!(
                path = %path.display(),
                "Could not create or read directory for client \"{}\": {}",
                client_name,
                e
            );
            false
        }
    }
}

async fn save_client_logdata(services: &RunServices, settings: &ServerSettings, job: &BackupJob) {
    let summary = services.logs.finalize(job.client_id);

    let db = services.db.clone();
    let data = CreateLogData {
        client_id: job.client_id,
        errors: summary.errors,
        warnings: summary.warnings,
        infos: summary.infos,
        image: job.kind == BackupKind::Image,
        incremental: job.is_incremental(),
        resumed: job.resumed,
    };
    let logdata = summary.logdata.clone();
    let saved = tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        backup_log::create_with_data(&mut conn, &data, &logdata)
    })
    .await;

    match saved {
        Ok(Ok(log_id)) => tracing::debug!(log_id, "Backup log saved"),
        Ok(Err(e)) => tracing::error!("Saving backup log failed: {:#}", e),
        Err(e) => tracing::error!("Backup log task failed: {}", e),
    }

    let report = RunReport {
        client_id: job.client_id,
        client_name: job.client_name.clone(),
        kind: job.kind,
        mode: job.mode,
        resumed: job.resumed,
        success: job.result && !job.early_error,
    };
    services
        .reports
        .dispatch(&settings.mail_server, &report, &summary)
        .await;
}

pub fn pretty_print_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
