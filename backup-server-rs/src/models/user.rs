use rusqlite::{params, Connection, OptionalExtension};

/// Raw report columns of a user, codes as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettingsRow {
    pub report_mail: String,
    pub report_loglevel: i64,
    pub report_sendonly: i64,
}

pub fn create(conn: &Connection, name: &str) -> anyhow::Result<i64> {
    conn.execute("INSERT INTO users (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

pub fn set_report_settings(
    conn: &Connection,
    user_id: i64,
    report_mail: Option<&str>,
    report_loglevel: i64,
    report_sendonly: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE users SET report_mail = ?1, report_loglevel = ?2, report_sendonly = ?3 WHERE id = ?4",
        params![report_mail, report_loglevel, report_sendonly, user_id],
    )?;
    Ok(())
}

pub fn set_right(conn: &Connection, user_id: i64, domain: &str, right: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO user_rights (user_id, domain, t_right) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id, domain) DO UPDATE SET t_right = excluded.t_right",
        params![user_id, domain, right],
    )?;
    Ok(())
}

/// Users with a report address configured.
pub fn find_mailable_user_ids(conn: &Connection) -> anyhow::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM users WHERE report_mail IS NOT NULL AND report_mail <> '' ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_report_settings(conn: &Connection, user_id: i64) -> anyhow::Result<Option<ReportSettingsRow>> {
    Ok(conn
        .query_row(
            "SELECT report_mail, report_loglevel, report_sendonly FROM users
             WHERE id = ? AND report_mail IS NOT NULL AND report_mail <> ''",
            params![user_id],
            |row| {
                Ok(ReportSettingsRow {
                    report_mail: row.get(0)?,
                    report_loglevel: row.get(1)?,
                    report_sendonly: row.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn find_right(conn: &Connection, user_id: i64, domain: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT t_right FROM user_rights WHERE user_id = ? AND domain = ?",
            params![user_id, domain],
            |row| row.get(0),
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::test_pool;

    #[test]
    fn test_only_users_with_address_are_mailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let conn = pool.get().unwrap();

        let admin = create(&conn, "admin").unwrap();
        let silent = create(&conn, "silent").unwrap();
        let blank = create(&conn, "blank").unwrap();
        set_report_settings(&conn, admin, Some("admin@example.org"), 1, 0).unwrap();
        set_report_settings(&conn, blank, Some(""), 0, 0).unwrap();

        assert_eq!(find_mailable_user_ids(&conn).unwrap(), vec![admin]);
        assert!(find_report_settings(&conn, silent).unwrap().is_none());
        assert!(find_report_settings(&conn, blank).unwrap().is_none());

        let row = find_report_settings(&conn, admin).unwrap().unwrap();
        assert_eq!(row.report_mail, "admin@example.org");
        assert_eq!(row.report_loglevel, 1);
        assert_eq!(row.report_sendonly, 0);
    }

    #[test]
    fn test_set_right_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool(dir.path());
        let conn = pool.get().unwrap();

        let user = create(&conn, "op").unwrap();
        set_right(&conn, user, "logs", "1,2").unwrap();
        set_right(&conn, user, "logs", "3").unwrap();

        assert_eq!(find_right(&conn, user, "logs").unwrap().as_deref(), Some("3"));
        assert_eq!(find_right(&conn, user, "all").unwrap(), None);
    }
}
