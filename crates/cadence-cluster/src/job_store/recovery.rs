use std::collections::BTreeSet;

use cadence_core::{InstanceId, TriggerKey};
use cadence_store::{
    FiredTriggerRecord, Schedule, SchedulerStateRecord, StoreError, TriggerRecord, TriggerState,
    RECOVERY_GROUP,
};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::JobStore;
use crate::cluster::ClusterScanner;
use crate::error::Result;
use crate::semaphore::LockName;

impl JobStore {
    /// One cluster check-in: heartbeat, then recover any failed instances.
    ///
    /// The first check-in of this instance runs entirely under STATE_ACCESS
    /// and treats its own earlier record and orphaned fired records as
    /// failed. Later check-ins heartbeat without a lock and only take the
    /// locks when some instance looks dead. Returns whether anything was
    /// recovered.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub fn check_in(&self) -> Result<bool> {
        let first = self.first_checkin.load(std::sync::atomic::Ordering::Acquire);
        if !first {
            let failed = self
                .executor
                .run_locked(None, |tx| self.cluster_check_in(tx.conn(), false))?;
            if failed.is_empty() {
                return Ok(false);
            }
        }
        let recovered = self
            .executor
            .run_locked(Some(LockName::StateAccess), |tx| {
                let failed = if first {
                    self.cluster_check_in(tx.conn(), true)?
                } else {
                    self.find_failed_instances(tx.conn(), false)?
                };
                if failed.is_empty() {
                    return Ok(false);
                }
                tx.obtain(LockName::TriggerAccess)?;
                self.cluster_recover(tx.conn(), &failed)?;
                Ok(true)
            })?;
        self.first_checkin
            .store(false, std::sync::atomic::Ordering::Release);
        Ok(recovered)
    }

    /// Delete this instance's heartbeat so peers do not wait for it to expire.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub fn check_out(&self) -> Result<()> {
        self.executor
            .run_locked(Some(LockName::StateAccess), |tx| {
                Ok(self
                    .delegate
                    .delete_scheduler_state(tx.conn(), &self.instance_id)?)
            })?;
        info!("checked out of cluster");
        Ok(())
    }

    /// Find failed instances, then write this instance's heartbeat.
    fn cluster_check_in(&self, conn: &Connection, first: bool) -> Result<Vec<SchedulerStateRecord>> {
        let failed = self.find_failed_instances(conn, first)?;
        let now = Utc::now();
        let interval = self.config.cluster.checkin_interval_ms as i64;
        if self
            .delegate
            .update_scheduler_state(conn, &self.instance_id, now, interval)?
            == 0
        {
            self.delegate
                .insert_scheduler_state(conn, &self.instance_id, now, interval)?;
        }
        Ok(failed)
    }

    fn find_failed_instances(
        &self,
        conn: &Connection,
        first: bool,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let now = Utc::now();
        let tolerance = self.config.cluster.tolerance_factor;
        let records = self.delegate.select_scheduler_state_records(conn)?;
        let mut found_self = false;
        let mut failed = Vec::new();

        for record in &records {
            if record.instance_id == self.instance_id {
                found_self = true;
                if first {
                    failed.push(record.clone());
                }
            } else if !record.is_alive(now, tolerance) {
                failed.push(record.clone());
            }
        }

        if first {
            // Fired records whose owner has no heartbeat row at all.
            let known: BTreeSet<&str> = records.iter().map(|r| r.instance_id.as_str()).collect();
            for owner in self.delegate.select_fired_trigger_instance_ids(conn)? {
                if !known.contains(owner.as_str()) {
                    warn!(orphan = %owner, "found fired triggers of an instance with no heartbeat");
                    failed.push(SchedulerStateRecord {
                        instance_id: InstanceId::from(owner),
                        last_checkin: now,
                        checkin_interval_ms: self.config.cluster.checkin_interval_ms as i64,
                    });
                }
            }
        }

        if !found_self && !first {
            warn!("this instance is still active but was recovered by another instance; check that clocks are in sync");
        }
        Ok(failed)
    }

    fn cluster_recover(&self, conn: &Connection, failed: &[SchedulerStateRecord]) -> Result<()> {
        for record in failed {
            let instance = &record.instance_id;
            info!(failed_instance = %instance, "scanning for failed instance's in-progress jobs");
            let fired = self
                .delegate
                .select_fired_trigger_records_for_instance(conn, instance)?;

            let mut requeued = 0usize;
            let mut recovering = 0usize;
            let mut touched: BTreeSet<TriggerKey> = BTreeSet::new();
            for ft in &fired {
                touched.insert(ft.trigger_key.clone());
                requeued += self.requeue_fired_trigger(conn, ft)?;
                if ft.state == TriggerState::Executing && ft.requests_recovery {
                    if self.store_recovery_trigger(conn, ft)? {
                        recovering += 1;
                    }
                }
                if ft.non_concurrent {
                    self.unblock_job_triggers(conn, &ft.job_key)?;
                }
            }
            self.delegate
                .delete_fired_triggers_for_instance(conn, instance)?;

            // Remove COMPLETE triggers whose last fired record just went away.
            let mut completed = 0usize;
            for key in &touched {
                if self.delegate.select_trigger_state(conn, key)? == Some(TriggerState::Complete)
                    && self
                        .delegate
                        .select_fired_trigger_records_for_trigger(conn, key)?
                        .is_empty()
                {
                    self.remove_trigger_in(conn, key)?;
                    completed += 1;
                }
            }

            info!(
                failed_instance = %instance,
                fired = fired.len(),
                requeued,
                recovering,
                completed,
                "recovered failed instance"
            );

            if *instance != self.instance_id {
                self.delegate.delete_scheduler_state(conn, instance)?;
            }
        }
        Ok(())
    }

    /// Make a fired record's trigger fireable again. Returns 1 if it moved.
    fn requeue_fired_trigger(&self, conn: &Connection, ft: &FiredTriggerRecord) -> Result<usize> {
        let key = &ft.trigger_key;
        match ft.state {
            TriggerState::Acquired => Ok(self.delegate.update_trigger_state_from_other_states(
                conn,
                key,
                TriggerState::Waiting,
                &[TriggerState::Acquired],
            )?),
            TriggerState::Executing => {
                let Some(trigger) = self.delegate.select_trigger(conn, key)? else {
                    return Ok(0);
                };
                let target = if trigger.next_fire_time.is_some() {
                    TriggerState::Waiting
                } else {
                    TriggerState::Complete
                };
                let moved = self.delegate.update_trigger_state_from_other_states(
                    conn,
                    key,
                    target,
                    &[TriggerState::Executing],
                )?;
                let unpaused = self.delegate.update_trigger_state_from_other_states(
                    conn,
                    key,
                    TriggerState::Paused,
                    &[TriggerState::PausedBlocked],
                )?;
                Ok(moved + unpaused)
            }
            _ => Ok(0),
        }
    }

    /// Store a one-shot trigger that re-runs the job of a firing that died
    /// with its instance. Returns `false` if the job is gone or the recovery
    /// trigger already exists.
    fn store_recovery_trigger(&self, conn: &Connection, ft: &FiredTriggerRecord) -> Result<bool> {
        if !self.delegate.job_exists(conn, &ft.job_key)? {
            warn!(job = %ft.job_key, entry_id = %ft.entry_id, "recoverable job no longer exists");
            return Ok(false);
        }
        let start = ft.scheduled_time.unwrap_or(ft.fired_time);
        let trigger = TriggerRecord::new(
            TriggerKey::new(format!("recover_{}", ft.entry_id), RECOVERY_GROUP),
            ft.job_key.clone(),
            Schedule::Once,
            start,
        )
        .with_priority(ft.priority)
        .with_misfire_policy(cadence_store::MisfirePolicy::IgnoreMisfires)
        .with_job_data(json!({
            "original_trigger_name": ft.trigger_key.name,
            "original_trigger_group": ft.trigger_key.group,
            "fired_time_ms": ft.fired_time.timestamp_millis(),
            "scheduled_time_ms": ft.scheduled_time.map(|t| t.timestamp_millis()),
        }));
        match self.delegate.insert_trigger(conn, &trigger) {
            Ok(()) => {
                debug!(trigger = %trigger.key, "recovery trigger stored");
                Ok(true)
            }
            Err(StoreError::ObjectAlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Startup recovery for a non-clustered store, under TRIGGER_ACCESS.
    pub(super) fn recover_jobs(&self) -> Result<()> {
        self.executor
            .run_locked(Some(LockName::TriggerAccess), |tx| self.recover_jobs_in(tx.conn()))
    }

    fn recover_jobs_in(&self, conn: &Connection) -> Result<()> {
        let in_flight = [
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Blocked,
        ];
        let exhausted = self.delegate.complete_exhausted_triggers(conn, &in_flight)?;
        let mut requeued = self.delegate.update_trigger_states_from_other_states(
            conn,
            TriggerState::Waiting,
            &in_flight,
        )?;
        requeued += self.delegate.update_trigger_states_from_other_states(
            conn,
            TriggerState::Paused,
            &[TriggerState::PausedBlocked],
        )?;
        info!(requeued, exhausted, "freed triggers from in-flight states");

        let misfires = self.recover_misfired_jobs_in(conn, true)?;
        info!(count = misfires.processed_count, "recovered misfired triggers");

        // Single instance: every fired record belongs to a dead incarnation.
        let mut recovering = 0usize;
        let mut fired_total = 0usize;
        for owner in self.delegate.select_fired_trigger_instance_ids(conn)? {
            let owner = InstanceId::from(owner);
            for ft in self
                .delegate
                .select_fired_trigger_records_for_instance(conn, &owner)?
            {
                if ft.state == TriggerState::Executing
                    && ft.requests_recovery
                    && self.store_recovery_trigger(conn, &ft)?
                {
                    recovering += 1;
                }
            }
            fired_total += self
                .delegate
                .delete_fired_triggers_for_instance(conn, &owner)?;
        }
        info!(recovering, fired = fired_total, "recovered jobs requesting recovery");

        let mut removed = 0usize;
        for key in self
            .delegate
            .select_trigger_keys_in_state(conn, TriggerState::Complete)?
        {
            if self.remove_trigger_in(conn, &key)? {
                removed += 1;
            }
        }
        info!(removed, "removed completed triggers");
        Ok(())
    }
}

impl ClusterScanner for JobStore {
    fn check_in(&self) -> Result<bool> {
        JobStore::check_in(self)
    }

    fn check_out(&self) -> Result<()> {
        JobStore::check_out(self)
    }
}
