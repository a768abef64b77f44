//! Named, store-wide mutual exclusion.
//!
//! A [`LockStrategy`] knows how to make one backend block until a named lock
//! is granted. [`Semaphore`] wraps a strategy with per-call-chain ownership
//! tracking through an explicit [`LockHandle`]: re-entrant acquisition is a
//! no-op and releasing a lock the handle does not own is logged, not fatal.

mod memory;
mod row;

use std::collections::BTreeSet;
use std::fmt;

use cadence_core::config::{LockStrategyKind, LockingConfig};
use cadence_store::Tables;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};

pub use memory::InProcessLockStrategy;
pub use row::{SelectLockStrategy, UpdateLockStrategy, DEFAULT_SELECT_WITH_LOCK_SQL};

/// The named locks every scheduler provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockName {
    /// Guards trigger and fired-trigger state transitions.
    TriggerAccess,
    /// Guards scheduler-state heartbeats and cluster recovery.
    StateAccess,
}

impl LockName {
    pub const ALL: [LockName; 2] = [LockName::TriggerAccess, LockName::StateAccess];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockName::TriggerAccess => "TRIGGER_ACCESS",
            LockName::StateAccess => "STATE_ACCESS",
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of locks one call chain currently holds.
///
/// Created per locked execution and threaded through it; never shared
/// between call chains.
#[derive(Debug)]
pub struct LockHandle {
    requestor: String,
    held: BTreeSet<LockName>,
}

impl LockHandle {
    pub fn new(requestor: impl Into<String>) -> Self {
        Self {
            requestor: requestor.into(),
            held: BTreeSet::new(),
        }
    }

    pub fn requestor(&self) -> &str {
        &self.requestor
    }

    pub fn holds(&self, lock: LockName) -> bool {
        self.held.contains(&lock)
    }

    pub fn held(&self) -> impl Iterator<Item = LockName> + '_ {
        self.held.iter().copied()
    }
}

/// One way of making a backend grant a named lock.
pub trait LockStrategy: Send + Sync + fmt::Debug {
    /// Block until `lock` is granted.
    ///
    /// Database strategies run their locking statement on `conn`, which must
    /// be inside a transaction that has issued no other statement yet.
    fn acquire(&self, conn: Option<&Connection>, lock: LockName) -> Result<()>;

    /// Give `lock` back. Database locks end with their transaction, so the
    /// default does nothing.
    fn release(&self, _lock: LockName) {}

    /// Whether `acquire` needs a transactional connection.
    fn requires_connection(&self) -> bool;

    /// How the transaction that carries the lock must begin.
    fn transaction_behavior(&self) -> TransactionBehavior {
        TransactionBehavior::Deferred
    }
}

/// Ownership-tracking wrapper around a [`LockStrategy`].
#[derive(Debug)]
pub struct Semaphore {
    strategy: Box<dyn LockStrategy>,
}

impl Semaphore {
    pub fn new(strategy: impl LockStrategy + 'static) -> Self {
        Self {
            strategy: Box::new(strategy),
        }
    }

    /// Obtain `lock` for the call chain behind `handle`, blocking until granted.
    ///
    /// Returns `true` if this call took the lock and `false` if the handle
    /// already held it. Either way the handle holds it afterwards.
    pub fn obtain(
        &self,
        conn: Option<&Connection>,
        handle: &mut LockHandle,
        lock: LockName,
    ) -> Result<bool> {
        if handle.holds(lock) {
            debug!(%lock, requestor = handle.requestor(), "lock already held, re-entrant obtain");
            return Ok(false);
        }
        if self.strategy.requires_connection() && conn.is_none() {
            return Err(ClusterError::LockRequiresConnection {
                lock: lock.as_str(),
            });
        }
        debug!(%lock, requestor = handle.requestor(), "lock requested");
        self.strategy.acquire(conn, lock)?;
        handle.held.insert(lock);
        debug!(%lock, requestor = handle.requestor(), "lock obtained");
        Ok(true)
    }

    /// Release `lock` if `handle` owns it; a release by a non-owner is logged and ignored.
    pub fn release(&self, handle: &mut LockHandle, lock: LockName) {
        if handle.held.remove(&lock) {
            self.strategy.release(lock);
            debug!(%lock, requestor = handle.requestor(), "lock released");
        } else {
            warn!(%lock, requestor = handle.requestor(), "lock release attempted by non-owner");
        }
    }

    /// Release everything `handle` still holds.
    pub fn release_all(&self, handle: &mut LockHandle) {
        let held: Vec<LockName> = handle.held().collect();
        for lock in held {
            self.release(handle, lock);
        }
    }

    pub fn is_owner(&self, handle: &LockHandle, lock: LockName) -> bool {
        handle.holds(lock)
    }

    pub fn requires_connection(&self) -> bool {
        self.strategy.requires_connection()
    }

    pub fn transaction_behavior(&self) -> TransactionBehavior {
        self.strategy.transaction_behavior()
    }
}

/// Pick the semaphore for a store from its locking config.
pub fn build_semaphore(
    locking: &LockingConfig,
    clustered: bool,
    tables: &Tables,
    sched_name: &str,
) -> Semaphore {
    if !locking.db_locks_enabled(clustered) {
        debug!("using in-process locks");
        return Semaphore::new(InProcessLockStrategy::new());
    }
    match locking.strategy {
        LockStrategyKind::RowSelect => {
            let template = locking
                .select_with_lock_sql
                .as_deref()
                .unwrap_or(DEFAULT_SELECT_WITH_LOCK_SQL);
            Semaphore::new(SelectLockStrategy::new(
                template,
                tables,
                sched_name,
                locking.retry_count,
                locking.retry_period(),
            ))
        }
        LockStrategyKind::RowUpdate => Semaphore::new(UpdateLockStrategy::new(
            tables,
            sched_name,
            locking.retry_count,
            locking.retry_period(),
        )),
    }
}
