use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &str) -> anyhow::Result<DbPool> {
    // Every pooled connection needs foreign keys enabled, not just the first one.
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = Pool::builder().max_size(8).build(manager)?;

    let conn = pool.get()?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(pool)
}

pub fn close_pool(pool: &DbPool) {
    if let Ok(conn) = pool.get() {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)") {
            tracing::warn!("WAL checkpoint on shutdown failed: {}", e);
        }
    }
}

/// Migrated pool backed by a file inside `dir`.
#[cfg(test)]
pub fn test_pool(dir: &std::path::Path) -> DbPool {
    let path = dir.join("test.db");
    let pool = create_pool(&path.to_string_lossy()).unwrap();
    crate::db::migrate::migrate(&pool).unwrap();
    pool
}
