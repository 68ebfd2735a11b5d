use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_all(conn: &Connection) -> anyhow::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = HashMap::new();
    for r in rows {
        let (k, v) = r?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Outgoing mail server. An empty `servername` means reports are disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailServer {
    pub servername: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub mail_from: String,
    pub ssl_only: bool,
    pub check_certificate: bool,
}

impl MailServer {
    pub fn is_configured(&self) -> bool {
        !self.servername.is_empty()
    }

    fn from_map(map: &HashMap<String, String>) -> Self {
        let text = |key: &str| map.get(key).cloned().unwrap_or_default();
        let flag = |key: &str, default: bool| {
            map.get(key)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };
        Self {
            servername: text("mail_servername"),
            port: map
                .get("mail_serverport")
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            username: text("mail_username"),
            password: text("mail_password"),
            mail_from: map
                .get("mail_from")
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| "report@urbackup.example".into()),
            ssl_only: flag("mail_ssl_only", false),
            check_certificate: flag("mail_check_certificate", true),
        }
    }
}

/// Settings snapshot held for the duration of one backup run.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub backup_folder: PathBuf,
    pub mail_server: MailServer,
}

impl ServerSettings {
    pub fn load(conn: &Connection, default_backup_folder: &Path) -> anyhow::Result<Self> {
        let map = get_all(conn)?;
        Ok(Self::from_map(&map, default_backup_folder))
    }

    pub fn defaults(default_backup_folder: &Path) -> Self {
        Self::from_map(&HashMap::new(), default_backup_folder)
    }

    fn from_map(map: &HashMap<String, String>, default_backup_folder: &Path) -> Self {
        let backup_folder = map
            .get("backupfolder")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_backup_folder.to_path_buf());
        Self {
            backup_folder,
            mail_server: MailServer::from_map(map),
        }
    }

    /// Folder for the client's backups. `None` unless the name is exactly one
    /// plain path component, so the result always stays inside `backup_folder`.
    pub fn client_folder(&self, client_name: &str) -> Option<PathBuf> {
        let mut parts = Path::new(client_name).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(part)), None) => Some(self.backup_folder.join(part)),
            _ => None,
        }
    }
}
