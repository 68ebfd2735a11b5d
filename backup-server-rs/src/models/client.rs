use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

const MAX_NAME_LEN: usize = 255;

/// Why a name can't be used for a client.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientNameError {
    #[error("client name is empty")]
    Empty,
    #[error("client name is longer than {} bytes", MAX_NAME_LEN)]
    TooLong,
    #[error("client name must not be \".\" or \"..\"")]
    DotName,
    #[error("client name contains forbidden character {0:?}")]
    Forbidden(char),
}

/// Client names become folder names and appear in mail headers.
pub fn validate_name(name: &str) -> Result<(), ClientNameError> {
    if name.is_empty() {
        return Err(ClientNameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ClientNameError::TooLong);
    }
    if name == "." || name == ".." {
        return Err(ClientNameError::DotName);
    }
    match name.chars().find(|c| matches!(c, '/' | '\\') || c.is_control()) {
        Some(c) => Err(ClientNameError::Forbidden(c)),
        None => Ok(()),
    }
}

fn row_to_client(row: &Row) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get("id")?,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Client>> {
    let mut stmt = conn.prepare("SELECT * FROM clients ORDER BY name")?;
    let rows = stmt.query_map([], row_to_client)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_name(conn: &Connection, name: &str) -> anyhow::Result<Option<Client>> {
    Ok(conn
        .query_row("SELECT * FROM clients WHERE name = ?", params![name], row_to_client)
        .optional()?)
}

/// Returns the client row for `name`, registering it on first contact.
pub fn find_or_create(conn: &Connection, name: &str) -> anyhow::Result<Client> {
    validate_name(name)?;
    conn.execute(
        "INSERT INTO clients (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        params![name],
    )?;
    find_by_name(conn, name)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve client {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_pool;

    #[test]
    fn test_find_or_create_is_stable() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let conn = pool.get().unwrap();

        let a = find_or_create(&conn, "laptop").unwrap();
        let b = find_or_create(&conn, "laptop").unwrap();
        let c = find_or_create(&conn, "nas").unwrap();

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(find_all(&conn).unwrap().len(), 2);
        assert!(find_by_name(&conn, "desktop").unwrap().is_none());
    }

    #[test]
    fn test_unsafe_names_rejected() {
        for name in ["office-pc", "pc.example.org", "PC 2", "..pc", "büro"] {
            assert_eq!(validate_name(name), Ok(()), "{name}");
        }
        assert_eq!(validate_name(""), Err(ClientNameError::Empty));
        assert_eq!(validate_name(".."), Err(ClientNameError::DotName));
        assert_eq!(validate_name("."), Err(ClientNameError::DotName));
        assert_eq!(validate_name("/etc/cron.d"), Err(ClientNameError::Forbidden('/')));
        assert_eq!(validate_name("../../root"), Err(ClientNameError::Forbidden('/')));
        assert_eq!(validate_name("a\\b"), Err(ClientNameError::Forbidden('\\')));
        assert_eq!(validate_name("pc\r\nBcc: x@y"), Err(ClientNameError::Forbidden('\r')));
        assert_eq!(validate_name(&"x".repeat(256)), Err(ClientNameError::TooLong));

        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let conn = pool.get().unwrap();
        assert!(find_or_create(&conn, "../escape").is_err());
        assert!(find_all(&conn).unwrap().is_empty());
    }
}
