use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

/// One row of the backup history.
#[derive(Debug, Clone, Serialize)]
pub struct BackupLog {
    pub id: i64,
    pub client_id: i64,
    pub errors: i64,
    pub warnings: i64,
    pub infos: i64,
    pub image: bool,
    pub incremental: bool,
    pub resumed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateLogData {
    pub client_id: i64,
    pub errors: i64,
    pub warnings: i64,
    pub infos: i64,
    pub image: bool,
    pub incremental: bool,
    pub resumed: bool,
}

fn row_to_log(row: &Row) -> rusqlite::Result<BackupLog> {
    Ok(BackupLog {
        id: row.get("id")?,
        client_id: row.get("client_id")?,
        errors: row.get("errors")?,
        warnings: row.get("warnings")?,
        infos: row.get("infos")?,
        image: row.get("image")?,
        incremental: row.get("incremental")?,
        resumed: row.get("resumed")?,
        created_at: row.get("created_at")?,
    })
}

/// Inserts the history row and its raw log atomically, returning the new row id.
pub fn create_with_data(conn: &mut Connection, data: &CreateLogData, logdata: &str) -> anyhow::Result<i64> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO backup_logs (client_id, errors, warnings, infos, image, incremental, resumed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            data.client_id,
            data.errors,
            data.warnings,
            data.infos,
            data.image,
            data.incremental,
            data.resumed,
        ],
    )?;
    let log_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO backup_log_data (log_id, data) VALUES (?1, ?2)",
        params![log_id, logdata],
    )?;
    tx.commit()?;
    Ok(log_id)
}

pub fn find_by_id(conn: &Connection, id: i64) -> anyhow::Result<Option<BackupLog>> {
    Ok(conn
        .query_row("SELECT * FROM backup_logs WHERE id = ?", params![id], row_to_log)
        .optional()?)
}

pub fn find_by_client_id(conn: &Connection, client_id: i64, limit: i64) -> anyhow::Result<Vec<BackupLog>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_logs WHERE client_id = ? ORDER BY id DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![client_id, limit], row_to_log)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_data(conn: &Connection, log_id: i64) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT data FROM backup_log_data WHERE log_id = ?",
            params![log_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// History aggregates per client, used by the statistics refresher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientHistoryStats {
    pub client_id: i64,
    pub client_name: String,
    pub runs: i64,
    pub errors: i64,
    pub warnings: i64,
    pub last_run_at: Option<String>,
}

pub fn aggregate_by_client(conn: &Connection) -> anyhow::Result<Vec<ClientHistoryStats>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.name, COUNT(l.id), COALESCE(SUM(l.errors), 0),
                COALESCE(SUM(l.warnings), 0), MAX(l.created_at)
         FROM clients c LEFT JOIN backup_logs l ON l.client_id = c.id
         GROUP BY c.id, c.name ORDER BY c.name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ClientHistoryStats {
            client_id: row.get(0)?,
            client_name: row.get(1)?,
            runs: row.get(2)?,
            errors: row.get(3)?,
            warnings: row.get(4)?,
            last_run_at: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_pool;
    use crate::models::client;

    #[test]
    fn test_log_data_references_new_row() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let mut conn = pool.get().unwrap();
        let c = client::find_or_create(&conn, "pc").unwrap();

        let data = CreateLogData {
            client_id: c.id,
            errors: 1,
            warnings: 0,
            infos: 2,
            image: false,
            incremental: true,
            resumed: true,
        };
        let first = create_with_data(&mut conn, &data, "0-1-a").unwrap();
        let second = create_with_data(&mut conn, &data, "2-2-b").unwrap();
        assert_ne!(first, second);

        assert_eq!(find_data(&conn, first).unwrap().as_deref(), Some("0-1-a"));
        assert_eq!(find_data(&conn, second).unwrap().as_deref(), Some("2-2-b"));

        let row = find_by_id(&conn, second).unwrap().unwrap();
        assert!(row.incremental && row.resumed && !row.image);
        assert_eq!(row.infos, 2);

        let history = find_by_client_id(&conn, c.id, 10).unwrap();
        assert_eq!(history.iter().map(|l| l.id).collect::<Vec<_>>(), vec![second, first]);
    }

    #[test]
    fn test_aggregate_includes_clients_without_runs() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let mut conn = pool.get().unwrap();
        let busy = client::find_or_create(&conn, "busy").unwrap();
        client::find_or_create(&conn, "idle").unwrap();

        for errors in [0, 3] {
            let data = CreateLogData {
                client_id: busy.id,
                errors,
                warnings: 1,
                infos: 0,
                image: true,
                incremental: false,
                resumed: false,
            };
            create_with_data(&mut conn, &data, "").unwrap();
        }

        let stats = aggregate_by_client(&conn).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].client_name, "busy");
        assert_eq!((stats[0].runs, stats[0].errors, stats[0].warnings), (2, 3, 2));
        assert!(stats[0].last_run_at.is_some());
        assert_eq!((stats[1].runs, stats[1].errors), (0, 0));
        assert!(stats[1].last_run_at.is_none());
    }
}
