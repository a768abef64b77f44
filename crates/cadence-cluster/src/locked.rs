use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_store::{is_busy, ConnectionPool};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{error, info, warn};

use crate::error::{ClusterError, Result};
use crate::pacing::FailureTracker;
use crate::semaphore::{LockHandle, LockName, Semaphore};

const STOP_POLL: Duration = Duration::from_millis(100);

/// Something that can run an operation while holding a named lock.
pub trait LockedExecutor {
    fn execute_in_lock<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T>;
}

/// What an operation sees while running under Locked Execution.
pub struct LockedTx<'a> {
    conn: &'a Connection,
    semaphore: &'a Semaphore,
    handle: &'a mut LockHandle,
}

impl LockedTx<'_> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    /// Take a further lock inside the same transaction.
    pub fn obtain(&mut self, lock: LockName) -> Result<()> {
        let conn = self.semaphore.requires_connection().then_some(self.conn);
        self.semaphore.obtain(conn, self.handle, lock)?;
        Ok(())
    }

    pub fn holds(&self, lock: LockName) -> bool {
        self.semaphore.is_owner(self.handle, lock)
    }
}

/// Releases whatever its handle holds when dropped, whatever the outcome.
struct HeldLocks<'s> {
    semaphore: &'s Semaphore,
    handle: LockHandle,
}

impl<'s> HeldLocks<'s> {
    fn new(semaphore: &'s Semaphore, requestor: &str) -> Self {
        Self {
            semaphore,
            handle: LockHandle::new(requestor),
        }
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        self.semaphore.release_all(&mut self.handle);
    }
}

/// Runs store operations under a named lock, one transaction each.
#[derive(Clone)]
pub struct LockedExecution {
    pool: Arc<ConnectionPool>,
    semaphore: Arc<Semaphore>,
    requestor: String,
}

impl LockedExecution {
    pub fn new(pool: Arc<ConnectionPool>, semaphore: Arc<Semaphore>, requestor: impl Into<String>) -> Self {
        Self {
            pool,
            semaphore,
            requestor: requestor.into(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Run `op` in a transaction of its own, holding `lock` if one is given.
    ///
    /// In-process locks are taken before a connection is checked out;
    /// database locks are the first statement of the transaction. Commits
    /// on `Ok`, rolls back on `Err`. Locks are released before the
    /// connection goes back to the pool.
    pub fn run_locked<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        let db_locks = self.semaphore.requires_connection();
        let mut held = HeldLocks::new(&self.semaphore, &self.requestor);
        if let (Some(lock), false) = (lock, db_locks) {
            self.semaphore.obtain(None, &mut held.handle, lock)?;
        }
        let mut conn = self.pool.get()?;
        let result = self.in_transaction(&mut conn, lock.filter(|_| db_locks), &mut held.handle, op);
        drop(held);
        drop(conn);
        result
    }

    fn in_transaction<T>(
        &self,
        conn: &mut Connection,
        db_lock: Option<LockName>,
        handle: &mut LockHandle,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        // Without a lock row to write first, a deferred transaction that reads
        // and then writes cannot wait for a peer's write lock under WAL.
        let behavior = match db_lock {
            Some(_) => self.semaphore.transaction_behavior(),
            None => TransactionBehavior::Immediate,
        };
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(|e| begin_failed(db_lock, e))?;
        if let Some(lock) = db_lock {
            self.semaphore.obtain(Some(&*tx), handle, lock)?;
        }
        let outcome = op(&mut LockedTx {
            conn: &*tx,
            semaphore: &self.semaphore,
            handle,
        });
        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "rollback after failed locked operation also failed");
                }
                Err(e)
            }
        }
    }

    /// Run `op` on a connection whose transaction the host manages.
    ///
    /// Only takes and releases locks; never begins, commits or rolls back.
    /// A database lock needs the host transaction to be open already.
    pub fn run_locked_in<T>(
        &self,
        conn: &Connection,
        lock: Option<LockName>,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        let db_locks = self.semaphore.requires_connection();
        let mut held = HeldLocks::new(&self.semaphore, &self.requestor);
        if let Some(lock) = lock {
            if db_locks {
                if conn.is_autocommit() {
                    return Err(ClusterError::NoHostTransaction {
                        lock: lock.as_str(),
                    });
                }
                self.semaphore.obtain(Some(conn), &mut held.handle, lock)?;
            } else {
                self.semaphore.obtain(None, &mut held.handle, lock)?;
            }
        }
        op(&mut LockedTx {
            conn,
            semaphore: &self.semaphore,
            handle: &mut held.handle,
        })
    }

    /// [`run_locked`](Self::run_locked), re-attempted every `retry_interval`
    /// while it fails with a retryable error.
    ///
    /// Gives up with [`ClusterError::ShuttingDown`] once `stop` is set.
    pub fn run_locked_with_retry<T>(
        &self,
        lock: Option<LockName>,
        retry_interval: Duration,
        failure_log_every: u32,
        stop: &AtomicBool,
        mut op: impl FnMut(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut failures = FailureTracker::new(failure_log_every);
        loop {
            match self.run_locked(lock, &mut op) {
                Ok(value) => {
                    let streak = failures.record_success();
                    if streak > 0 {
                        info!(retries = streak, "locked operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if failures.record_failure() {
                        error!(
                            error = %e,
                            failures = failures.consecutive(),
                            "locked operation failed; retrying in {:?}",
                            retry_interval
                        );
                    }
                    if !sleep_unless_stopped(stop, retry_interval) {
                        return Err(ClusterError::ShuttingDown);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl LockedExecutor for LockedExecution {
    fn execute_in_lock<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        self.run_locked(lock, op)
    }
}

fn begin_failed(db_lock: Option<LockName>, err: rusqlite::Error) -> ClusterError {
    match db_lock {
        Some(lock) if is_busy(&err) => ClusterError::LockFailed {
            lock: lock.as_str(),
            attempts: 1,
            source: err,
        },
        _ => ClusterError::Database(err),
    }
}

/// Blocking sleep that wakes early when `stop` is set. Returns `false` if stopped.
fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::{InProcessLockStrategy, UpdateLockStrategy};
    use cadence_store::{init_db, provision_locks, Tables};

    fn execution(db_locks: bool) -> (tempfile::TempDir, LockedExecution) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(
            ConnectionPool::open(dir.path().join("locked.db"), Duration::from_secs(5), 2).unwrap(),
        );
        let tables = Tables::new("t_");
        {
            let conn = pool.get().unwrap();
            init_db(&conn, &tables).unwrap();
            provision_locks(&conn, &tables, "s").unwrap();
            conn.execute_batch("CREATE TABLE probe (v INTEGER)").unwrap();
        }
        let semaphore = if db_locks {
            Semaphore::new(UpdateLockStrategy::new(&tables, "s", 0, Duration::ZERO))
        } else {
            Semaphore::new(InProcessLockStrategy::new())
        };
        (dir, LockedExecution::new(pool, Arc::new(semaphore), "test"))
    }

    fn probe_count(exec: &LockedExecution) -> i64 {
        exec.pool()
            .get()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM probe", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn commits_on_success_and_rolls_back_on_error() {
        let (_dir, exec) = execution(true);
        exec.run_locked(Some(LockName::TriggerAccess), |tx| {
            assert!(tx.holds(LockName::TriggerAccess));
            tx.conn().execute("INSERT INTO probe VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        let err = exec
            .run_locked(Some(LockName::TriggerAccess), |tx| {
                tx.conn().execute("INSERT INTO probe VALUES (2)", [])?;
                Err::<(), _>(ClusterError::Task("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::Task(_)));
        assert_eq!(probe_count(&exec), 1);
    }

    #[test]
    fn in_process_lock_is_released_after_failure() {
        let (_dir, exec) = execution(false);
        let _ = exec.run_locked(Some(LockName::StateAccess), |_| {
            Err::<(), _>(ClusterError::Task("boom".into()))
        });
        // Would block forever if the failed run leaked its lock.
        exec.run_locked(Some(LockName::StateAccess), |_| Ok(()))
            .unwrap();
    }

    #[test]
    fn nested_obtain_inside_transaction() {
        let (_dir, exec) = execution(true);
        exec.run_locked(Some(LockName::StateAccess), |tx| {
            tx.obtain(LockName::TriggerAccess)?;
            tx.obtain(LockName::TriggerAccess)?;
            assert!(tx.holds(LockName::StateAccess) && tx.holds(LockName::TriggerAccess));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn host_transaction_is_left_to_the_host() {
        let (_dir, exec) = execution(true);
        let mut conn = exec.pool().get().unwrap();
        let tx = conn.transaction().unwrap();
        exec.run_locked_in(&tx, Some(LockName::TriggerAccess), |locked| {
            locked.conn().execute("INSERT INTO probe VALUES (7)", [])?;
            Ok(())
        })
        .unwrap();
        assert!(!tx.is_autocommit());
        tx.rollback().unwrap();
        drop(conn);
        assert_eq!(probe_count(&exec), 0);
    }

    #[test]
    fn host_lock_without_transaction_is_rejected() {
        let (_dir, exec) = execution(true);
        let conn = exec.pool().get().unwrap();
        let err = exec
            .run_locked_in(&conn, Some(LockName::TriggerAccess), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoHostTransaction { .. }));
    }

    #[test]
    fn retry_gives_up_when_stopped() {
        let (_dir, exec) = execution(false);
        let stop = AtomicBool::new(true);
        let mut attempts = 0;
        let err = exec
            .run_locked_with_retry(None, Duration::from_secs(60), 4, &stop, |_| {
                attempts += 1;
                Err::<(), _>(ClusterError::Task("transient".into()))
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::ShuttingDown));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn retry_stops_on_fatal_error() {
        let (_dir, exec) = execution(false);
        let stop = AtomicBool::new(false);
        let err = exec
            .run_locked_with_retry(None, Duration::from_millis(1), 4, &stop, |_| {
                Err::<(), _>(ClusterError::LockRowMissing {
                    lock: "TRIGGER_ACCESS",
                    scheduler: "s".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::LockRowMissing { .. }));
    }
}
