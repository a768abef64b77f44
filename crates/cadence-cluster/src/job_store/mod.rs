//! The job-store façade: the trigger state machine plus the scan passes the
//! cluster manager and misfire handler drive.

mod firing;
mod misfire;
mod recovery;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cadence_core::config::TxMode;
use cadence_core::{CadenceConfig, InstanceId, JobKey, TriggerKey};
use cadence_store::{
    init_db, provision_locks, ConnectionPool, JobRecord, StoreDelegate, Tables, TriggerRecord,
    TriggerState,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{info, instrument};

use crate::error::{ClusterError, Result};
use crate::locked::{LockedExecution, LockedExecutor, LockedTx};
use crate::semaphore::{build_semaphore, LockName};
use crate::signal::SchedulerSignaler;

pub use firing::{
    AcquiredTrigger, CompletedExecutionInstruction, FiredBundle, FiredOutcome, SkipReason,
};
pub use misfire::RecoverMisfiredJobsResult;

/// Persistent, cluster-aware store of jobs and triggers for one scheduler instance.
pub struct JobStore {
    config: CadenceConfig,
    instance_id: InstanceId,
    delegate: StoreDelegate,
    executor: LockedExecution,
    signaler: Arc<dyn SchedulerSignaler>,
    fired_counter: AtomicU64,
    first_checkin: AtomicBool,
    shutting_down: AtomicBool,
}

impl JobStore {
    /// Open the database, provision schema and lock rows if configured, and
    /// pick the semaphore.
    pub fn open(config: CadenceConfig, signaler: Arc<dyn SchedulerSignaler>) -> Result<Self> {
        config.validate()?;
        let store = &config.store;
        let instance_id = InstanceId::from_config(&store.instance_id);
        let pool = Arc::new(ConnectionPool::open(
            &store.path,
            store.busy_timeout(),
            store.max_connections,
        )?);
        let tables = Tables::new(&store.table_prefix);
        if store.provision_schema {
            let conn = pool.get()?;
            init_db(&conn, &tables)?;
            provision_locks(&conn, &tables, &store.scheduler_name)?;
        }
        let semaphore = build_semaphore(&config.locking, store.clustered, &tables, &store.scheduler_name);
        info!(
            instance_id = %instance_id,
            scheduler = %store.scheduler_name,
            clustered = store.clustered,
            db_locks = semaphore.requires_connection(),
            "job store opened"
        );
        let executor = LockedExecution::new(pool, Arc::new(semaphore), instance_id.as_str());
        let delegate = StoreDelegate::new(tables, store.scheduler_name.clone());
        Ok(Self {
            config,
            instance_id,
            delegate,
            executor,
            signaler,
            fired_counter: AtomicU64::new(Utc::now().timestamp_millis().max(0) as u64),
            first_checkin: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    pub fn is_clustered(&self) -> bool {
        self.config.store.clustered
    }

    pub fn delegate(&self) -> &StoreDelegate {
        &self.delegate
    }

    pub fn executor(&self) -> &LockedExecution {
        &self.executor
    }

    pub fn signaler(&self) -> &dyn SchedulerSignaler {
        self.signaler.as_ref()
    }

    /// Run startup recovery for a non-clustered store. Clustered stores
    /// recover through their first check-in instead.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub fn scheduler_started(&self) -> Result<()> {
        if self.is_clustered() {
            return Ok(());
        }
        self.recover_jobs()
    }

    /// Stop retrying locked operations; they fail with [`ClusterError::ShuttingDown`].
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!(instance_id = %self.instance_id, "job store shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Bind foreground operations to a host-managed transaction on `conn`.
    pub fn with_host_transaction<'c>(&'c self, conn: &'c Connection) -> HostTransaction<'c> {
        HostTransaction { store: self, conn }
    }

    /// Fired-trigger entry ids are this instance's id plus a counter seeded
    /// from the wall clock, so they stay unique across restarts.
    fn next_entry_id(&self) -> String {
        let n = self.fired_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.instance_id, n)
    }

    fn misfire_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::milliseconds(self.config.misfire.threshold_ms as i64)
    }
}

impl LockedExecutor for JobStore {
    fn execute_in_lock<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        if self.config.store.tx_mode == TxMode::Managed {
            return Err(ClusterError::HostTransactionRequired);
        }
        self.executor.run_locked(lock, op)
    }
}

/// Foreground operations bound to a transaction the host begins and ends.
///
/// Only locks are taken and released; the host commits or rolls back.
pub struct HostTransaction<'c> {
    store: &'c JobStore,
    conn: &'c Connection,
}

impl LockedExecutor for HostTransaction<'_> {
    fn execute_in_lock<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnOnce(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        self.store.executor.run_locked_in(self.conn, lock, op)
    }
}

/// The trigger state machine as seen by the scheduler's foreground path.
///
/// Every operation runs inside Locked Execution; implementors decide who
/// owns the transaction.
pub trait TriggerStore: LockedExecutor {
    fn job_store(&self) -> &JobStore;

    /// Like `execute_in_lock`, but keeps retrying transient failures where
    /// the implementor owns the transaction.
    fn execute_with_retry<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnMut(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        self.execute_in_lock(lock, op)
    }

    /// Store `job`, replacing an existing definition only if asked to.
    fn store_job(&self, job: &JobRecord, replace_existing: bool) -> Result<()> {
        let store = self.job_store();
        self.execute_in_lock(Some(LockName::TriggerAccess), |tx| {
            store.store_job_in(tx.conn(), job, replace_existing)
        })
    }

    /// Store `trigger` for an existing job. It starts WAITING, or BLOCKED
    /// while its non-concurrent job is executing.
    fn store_trigger(&self, trigger: &TriggerRecord, replace_existing: bool) -> Result<()> {
        let store = self.job_store();
        self.execute_in_lock(Some(LockName::TriggerAccess), |tx| {
            store.store_trigger_in(tx.conn(), trigger, replace_existing)
        })?;
        store
            .signaler
            .signal_scheduling_change(trigger.next_fire_time);
        Ok(())
    }

    /// Remove a trigger, and its job if that was non-durable and is now orphaned.
    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let store = self.job_store();
        self.execute_in_lock(Some(LockName::TriggerAccess), |tx| {
            store.remove_trigger_in(tx.conn(), key)
        })
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>> {
        let store = self.job_store();
        self.execute_in_lock(None, |tx| Ok(store.delegate.select_trigger(tx.conn(), key)?))
    }

    fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        let store = self.job_store();
        self.execute_in_lock(None, |tx| Ok(store.delegate.select_job(tx.conn(), key)?))
    }

    fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        let store = self.job_store();
        self.execute_in_lock(None, |tx| {
            Ok(store.delegate.select_trigger_state(tx.conn(), key)?)
        })
    }

    /// WAITING/ACQUIRED → PAUSED, BLOCKED/EXECUTING → PAUSED_BLOCKED.
    fn pause_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let store = self.job_store();
        self.execute_in_lock(Some(LockName::TriggerAccess), |tx| {
            store.pause_trigger_in(tx.conn(), key)
        })
    }

    /// Undo a pause, applying the misfire policy if the trigger fell behind.
    fn resume_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let store = self.job_store();
        self.execute_in_lock(Some(LockName::TriggerAccess), |tx| {
            store.resume_trigger_in(tx.conn(), key)
        })
    }

    /// Claim up to `max_count` triggers due by `no_later_than + time_window`.
    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> Result<Vec<AcquiredTrigger>> {
        let store = self.job_store();
        let lock = (store.config.store.acquire_triggers_within_lock || max_count > 1)
            .then_some(LockName::TriggerAccess);
        self.execute_in_lock(lock, |tx| {
            store.acquire_next_triggers_in(tx.conn(), no_later_than, max_count, time_window)
        })
    }

    /// Hand an acquired trigger back without firing it.
    fn release_acquired_trigger(&self, acquired: &AcquiredTrigger) -> Result<()> {
        let store = self.job_store();
        self.execute_with_retry(Some(LockName::TriggerAccess), |tx| {
            store.release_acquired_trigger_in(tx.conn(), acquired)
        })
    }

    /// Move acquired triggers to EXECUTING. Triggers lost to another
    /// instance come back as [`FiredOutcome::Skipped`].
    fn triggers_fired(&self, acquired: &[AcquiredTrigger]) -> Result<Vec<FiredOutcome>> {
        let store = self.job_store();
        self.execute_in_lock(Some(LockName::TriggerAccess), |tx| {
            acquired
                .iter()
                .map(|a| store.trigger_fired_in(tx.conn(), a))
                .collect()
        })
    }

    /// Record the end of a firing and apply `instruction`.
    fn triggered_job_complete(
        &self,
        bundle: &FiredBundle,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let store = self.job_store();
        self.execute_with_retry(Some(LockName::TriggerAccess), |tx| {
            store.triggered_job_complete_in(tx.conn(), bundle, instruction)
        })?;
        store.signaler.signal_scheduling_change(None);
        Ok(())
    }
}

impl TriggerStore for JobStore {
    fn job_store(&self) -> &JobStore {
        self
    }

    fn execute_with_retry<T>(
        &self,
        lock: Option<LockName>,
        op: impl FnMut(&mut LockedTx<'_>) -> Result<T>,
    ) -> Result<T> {
        if self.config.store.tx_mode == TxMode::Managed {
            return Err(ClusterError::HostTransactionRequired);
        }
        self.executor.run_locked_with_retry(
            lock,
            self.config.store.db_retry_interval(),
            self.config.cluster.failure_log_every,
            &self.shutting_down,
            op,
        )
    }
}

impl TriggerStore for HostTransaction<'_> {
    fn job_store(&self) -> &JobStore {
        self.store
    }
}
