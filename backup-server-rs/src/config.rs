use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Default backup folder, overridden by the `backupfolder` setting.
    pub backups_dir: PathBuf,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/backup-run-server".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(55414),
            db_path: data_dir.join("backup-server.db"),
            data_dir,
            backups_dir: PathBuf::from(
                std::env::var("BACKUPS_DIR").unwrap_or_else(|_| "/backup/data/backups".into()),
            ),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }

    #[cfg(test)]
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            port: 0,
            data_dir: root.to_path_buf(),
            db_path: root.join("backup-server.db"),
            backups_dir: root.join("backups"),
            log_level: "debug".into(),
        }
    }
}
