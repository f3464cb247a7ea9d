//! Pooled `SQLite` connections.
//!
//! Every connection handed out by the pool has been prepared with the
//! session pragmas in [`ConnectionConfig::session_sql`]: WAL journaling,
//! `synchronous = NORMAL`, enforced foreign keys and the configured busy
//! timeout. Committed events survive a process crash under these settings.

use std::time::Duration;

use loom_settings::StorageSettings;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use crate::errors::Result;

/// Pool of prepared connections.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Connection checked out of a [`ConnectionPool`].
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and per-connection pragmas.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Upper bound on open connections.
    pub pool_size: u32,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: i64,
    /// How long `pool.get()` waits for a free connection.
    pub checkout_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&StorageSettings::default())
    }
}

impl From<&StorageSettings> for ConnectionConfig {
    fn from(settings: &StorageSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            busy_timeout_ms: settings.busy_timeout_ms,
            cache_size_kib: settings.cache_size_kib,
            checkout_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Pragmas applied to each connection as it is acquired.
    pub fn session_sql(&self) -> String {
        format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};
             PRAGMA cache_size = -{};",
            self.busy_timeout_ms, self.cache_size_kib
        )
    }

    fn pool(&self, manager: SqliteConnectionManager) -> Result<ConnectionPool> {
        let session_sql = self.session_sql();
        let manager = manager.with_init(move |conn| conn.execute_batch(&session_sql));
        Ok(Pool::builder()
            .max_size(self.pool_size)
            .connection_timeout(self.checkout_timeout)
            .build(manager)?)
    }
}

/// Pool over a database file, created if missing.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    config.pool(SqliteConnectionManager::file(path))
}

/// Pool over a private in-memory database shared by all of its connections.
///
/// The database lives as long as at least one pooled connection is open.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let uri = format!("file:loom_{}?mode=memory&cache=shared", uuid::Uuid::now_v7().simple());
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI;
    config.pool(SqliteConnectionManager::file(uri).with_flags(flags))
}

/// Journal mode and foreign-key enforcement as seen by `conn`.
#[derive(Debug, PartialEq, Eq)]
pub struct SessionState {
    /// `wal` for files, `memory` for in-memory databases.
    pub journal_mode: String,
    /// Whether `PRAGMA foreign_keys` is on.
    pub foreign_keys: bool,
}

/// Read back the session pragmas from a live connection.
pub fn session_state(conn: &Connection) -> Result<SessionState> {
    let journal_mode = conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?;
    let foreign_keys: i64 = conn.pragma_query_value(None, "foreign_keys", |row| row.get(0))?;
    Ok(SessionState {
        journal_mode,
        foreign_keys: foreign_keys == 1,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_connections_share_one_database() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        a.execute_batch("CREATE TABLE shared_rows (x INTEGER); INSERT INTO shared_rows VALUES (1);")
            .unwrap();
        let n: i64 = b.query_row("SELECT COUNT(*) FROM shared_rows", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
        assert!(session_state(&a).unwrap().foreign_keys);
    }

    #[test]
    fn separate_in_memory_pools_are_isolated() {
        let first = new_in_memory(&ConnectionConfig::default()).unwrap();
        let second = new_in_memory(&ConnectionConfig::default()).unwrap();
        first.get().unwrap().execute_batch("CREATE TABLE only_here (x INTEGER);").unwrap();
        let found: i64 = second
            .get()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'only_here'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(found, 0);
    }

    #[test]
    fn file_pool_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = new_file(path.to_str().unwrap(), &ConnectionConfig::default()).unwrap();
        let state = session_state(&pool.get().unwrap()).unwrap();
        assert_eq!(
            state,
            SessionState {
                journal_mode: "wal".into(),
                foreign_keys: true,
            }
        );
    }

    #[test]
    fn config_follows_storage_settings() {
        let settings = StorageSettings {
            pool_size: 3,
            ..StorageSettings::default()
        };
        let config = ConnectionConfig::from(&settings);
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.busy_timeout_ms, settings.busy_timeout_ms);
        assert!(config.session_sql().contains("busy_timeout = 30000"));
    }
}
