use serde::{Deserialize, Serialize};

use crate::services::status_registry::StatusAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    File,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingPolicy {
    /// Nothing is logged, persisted or reported.
    Never,
    /// Logged unless the engine suppresses it for this run.
    #[default]
    IfNotSuppressed,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    #[default]
    Scheduled,
    Manual,
}

/// One backup run for one client. Owned by the runner until the run ends.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub run_id: uuid::Uuid,
    pub client_id: i64,
    pub client_name: String,
    pub kind: BackupKind,
    pub mode: BackupMode,
    pub resumed: bool,
    pub logging: LoggingPolicy,
    pub trigger: RunTrigger,
    /// Set by the engine to keep an `IfNotSuppressed` run out of the history.
    pub suppress_log: bool,
    pub early_error: bool,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: bool,
}

impl BackupJob {
    pub fn new(client_id: i64, client_name: impl Into<String>, kind: BackupKind, mode: BackupMode) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            client_id,
            client_name: client_name.into(),
            kind,
            mode,
            resumed: false,
            logging: LoggingPolicy::default(),
            trigger: RunTrigger::default(),
            suppress_log: false,
            early_error: false,
            started_at: None,
            result: false,
        }
    }

    pub fn resumed(mut self, resumed: bool) -> Self {
        self.resumed = resumed;
        self
    }

    pub fn logging(mut self, logging: LoggingPolicy) -> Self {
        self.logging = logging;
        self
    }

    pub fn trigger(mut self, trigger: RunTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    #[cfg(test)]
    pub fn early_error(mut self, early_error: bool) -> Self {
        self.early_error = early_error;
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.mode == BackupMode::Incremental
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging != LoggingPolicy::Never
    }

    /// Whether the run ends up in the history and gets reported.
    pub fn should_persist_log(&self) -> bool {
        match self.logging {
            LoggingPolicy::Never => false,
            LoggingPolicy::Always => true,
            LoggingPolicy::IfNotSuppressed => !self.suppress_log,
        }
    }

    /// Status shown while this run is active. Image runs don't report resumption.
    pub fn status_action(&self) -> StatusAction {
        match (self.kind, self.mode, self.resumed) {
            (BackupKind::File, BackupMode::Full, false) => StatusAction::FullFile,
            (BackupKind::File, BackupMode::Full, true) => StatusAction::ResumeFullFile,
            (BackupKind::File, BackupMode::Incremental, false) => StatusAction::IncrFile,
            (BackupKind::File, BackupMode::Incremental, true) => StatusAction::ResumeIncrFile,
            (BackupKind::Image, BackupMode::Full, _) => StatusAction::FullImage,
            (BackupKind::Image, BackupMode::Incremental, _) => StatusAction::IncrImage,
        }
    }

    /// File runs can't know their size up front.
    pub fn initial_percent(&self) -> i32 {
        match self.kind {
            BackupKind::File => -1,
            BackupKind::Image => 0,
        }
    }
}
