use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::Result;

/// A bounded pool of SQLite connections to one database file.
///
/// Every connection gets the same busy timeout, so a statement that needs the
/// write lock waits in SQLite's busy handler instead of failing immediately.
pub struct ConnectionPool {
    path: PathBuf,
    inner: Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    /// Open up to `max_size` connections and switch the database to WAL journaling.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration, max_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch("PRAGMA foreign_keys=ON;")
        });
        let inner = Pool::builder().max_size(max_size.max(1)).build(manager)?;
        inner.get()?.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!(path = %path.display(), max_size, "opened SQLite connection pool");
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow a connection; it returns to the pool when the guard drops.
    pub fn get(&self) -> Result<PooledConnection> {
        Ok(PooledConnection(self.inner.get()?))
    }

    pub fn idle_connections(&self) -> u32 {
        self.inner.state().idle_connections
    }
}

/// Connection borrowed from a [`ConnectionPool`].
///
/// A transaction left open on it is rolled back before it goes back.
pub struct PooledConnection(r2d2::PooledConnection<SqliteConnectionManager>);

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.0
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.0.is_autocommit() {
            return;
        }
        warn!("pooled connection returned with an open transaction; rolling back");
        if let Err(e) = self.0.execute_batch("ROLLBACK") {
            warn!(error = %e, "rollback of abandoned transaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("p.db"), Duration::from_secs(1), 2).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.idle_connections(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.idle_connections(), 2);
    }

    #[test]
    fn abandoned_transaction_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("p.db"), Duration::from_secs(1), 1).unwrap();
        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER)")
            .unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("BEGIN; INSERT INTO t VALUES (1);").unwrap();
        }
        let conn = pool.get().unwrap();
        assert!(conn.is_autocommit());
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 0);
    }
}
