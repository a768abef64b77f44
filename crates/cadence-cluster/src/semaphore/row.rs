use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cadence_store::{is_busy, Tables};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, warn};

use super::{LockName, LockStrategy};
use crate::error::{ClusterError, Result};

/// Row-locking select. `{prefix}` expands to the table prefix.
pub const DEFAULT_SELECT_WITH_LOCK_SQL: &str =
    "SELECT lock_name FROM {prefix}locks WHERE sched_name = ?1 AND lock_name = ?2";

/// Bookkeeping shared by both row strategies: bounded retry on write
/// conflicts and the missing-versus-vanished distinction for zero rows.
#[derive(Debug)]
struct LockRows {
    sched_name: String,
    retry_count: u32,
    retry_period: Duration,
    /// Locks this strategy has found a row for at least once.
    seen: Mutex<HashSet<LockName>>,
}

impl LockRows {
    fn new(sched_name: &str, retry_count: u32, retry_period: Duration) -> Self {
        Self {
            sched_name: sched_name.to_string(),
            retry_count,
            retry_period,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Run `statement` until it reports how many lock rows it touched.
    fn run(
        &self,
        lock: LockName,
        mut statement: impl FnMut() -> rusqlite::Result<usize>,
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match statement() {
                Ok(0) => return Err(self.zero_rows(lock)),
                Ok(_) => {
                    self.seen
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(lock);
                    return Ok(());
                }
                Err(e) if is_busy(&e) && attempt < self.retry_count => {
                    attempt += 1;
                    debug!(%lock, attempt, "lock row busy, retrying");
                    std::thread::sleep(self.retry_period);
                }
                Err(e) if is_busy(&e) => {
                    return Err(ClusterError::LockFailed {
                        lock: lock.as_str(),
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn zero_rows(&self, lock: LockName) -> ClusterError {
        let seen = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&lock);
        if seen {
            warn!(%lock, scheduler = %self.sched_name, "lock row vanished");
            ClusterError::LockRowVanished {
                lock: lock.as_str(),
                scheduler: self.sched_name.clone(),
            }
        } else {
            ClusterError::LockRowMissing {
                lock: lock.as_str(),
                scheduler: self.sched_name.clone(),
            }
        }
    }
}

fn require_conn(conn: Option<&Connection>, lock: LockName) -> Result<&Connection> {
    conn.ok_or(ClusterError::LockRequiresConnection {
        lock: lock.as_str(),
    })
}

/// Locks by reading the lock row inside an `IMMEDIATE` transaction.
///
/// SQLite has no `SELECT ... FOR UPDATE`; beginning the transaction reserves
/// the database write lock, which blocks every other locker until commit or
/// rollback. The select then proves the lock row exists.
#[derive(Debug)]
pub struct SelectLockStrategy {
    sql: String,
    rows: LockRows,
}

impl SelectLockStrategy {
    pub fn new(
        template: &str,
        tables: &Tables,
        sched_name: &str,
        retry_count: u32,
        retry_period: Duration,
    ) -> Self {
        Self {
            sql: template.replace("{prefix}", &tables.prefix),
            rows: LockRows::new(sched_name, retry_count, retry_period),
        }
    }
}

impl LockStrategy for SelectLockStrategy {
    fn acquire(&self, conn: Option<&Connection>, lock: LockName) -> Result<()> {
        let conn = require_conn(conn, lock)?;
        self.rows.run(lock, || {
            let mut stmt = conn.prepare_cached(&self.sql)?;
            let mut rows = stmt.query(params![self.rows.sched_name, lock.as_str()])?;
            let found = rows.next()?.is_some();
            Ok(usize::from(found))
        })
    }

    fn requires_connection(&self) -> bool {
        true
    }

    fn transaction_behavior(&self) -> TransactionBehavior {
        TransactionBehavior::Immediate
    }
}

/// Locks by writing the lock row as the first statement of the transaction.
///
/// The no-op update needs SQLite's write lock, so a concurrent locker waits
/// in the busy handler; a busy error after that is retried `retry_count`
/// times before surfacing as [`ClusterError::LockFailed`].
#[derive(Debug)]
pub struct UpdateLockStrategy {
    sql: String,
    rows: LockRows,
}

impl UpdateLockStrategy {
    pub fn new(tables: &Tables, sched_name: &str, retry_count: u32, retry_period: Duration) -> Self {
        Self {
            sql: format!(
                "UPDATE {} SET lock_name = lock_name WHERE sched_name = ?1 AND lock_name = ?2",
                tables.locks
            ),
            rows: LockRows::new(sched_name, retry_count, retry_period),
        }
    }
}

impl LockStrategy for UpdateLockStrategy {
    fn acquire(&self, conn: Option<&Connection>, lock: LockName) -> Result<()> {
        let conn = require_conn(conn, lock)?;
        self.rows.run(lock, || {
            conn.prepare_cached(&self.sql)?
                .execute(params![self.rows.sched_name, lock.as_str()])
        })
    }

    fn requires_connection(&self) -> bool {
        true
    }
}
