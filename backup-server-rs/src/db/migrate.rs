use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS backup_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  client_id INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
  errors INTEGER NOT NULL DEFAULT 0,
  warnings INTEGER NOT NULL DEFAULT 0,
  infos INTEGER NOT NULL DEFAULT 0,
  image INTEGER NOT NULL DEFAULT 0 CHECK(image IN (0,1)),
  incremental INTEGER NOT NULL DEFAULT 0 CHECK(incremental IN (0,1)),
  resumed INTEGER NOT NULL DEFAULT 0 CHECK(resumed IN (0,1)),
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS backup_log_data (
  log_id INTEGER PRIMARY KEY REFERENCES backup_logs(id) ON DELETE CASCADE,
  data TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  report_mail TEXT,
  report_loglevel INTEGER NOT NULL DEFAULT 0,
  report_sendonly INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_rights (
  user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  domain TEXT NOT NULL,
  t_right TEXT NOT NULL,
  PRIMARY KEY (user_id, domain)
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_logs_client_id ON backup_logs(client_id);
CREATE INDEX IF NOT EXISTS idx_backup_logs_created_at ON backup_logs(created_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    // Databases created before resumed runs were tracked
    if !has_column("backup_logs", "resumed")? {
        conn.execute_batch(
            "ALTER TABLE backup_logs ADD COLUMN resumed INTEGER NOT NULL DEFAULT 0",
        )?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
