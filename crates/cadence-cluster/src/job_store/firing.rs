use cadence_core::TriggerKey;
use cadence_store::{
    FiredTriggerRecord, JobRecord, StoreError, TriggerRecord, TriggerState,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::JobStore;
use crate::error::Result;

/// How many times acquisition re-scans when every candidate was lost.
const MAX_ACQUIRE_SCANS: usize = 3;

/// A trigger this instance claimed for an upcoming firing.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredTrigger {
    /// Id of the fired-trigger record backing the claim.
    pub entry_id: String,
    pub trigger: TriggerRecord,
}

/// Everything the scheduler needs to run a job for one firing.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredBundle {
    pub entry_id: String,
    /// The trigger after its fire times were advanced.
    pub trigger: TriggerRecord,
    pub job: JobRecord,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The trigger left ACQUIRED before it could fire.
    LostRace,
    /// Its non-concurrent job is already executing somewhere.
    JobBlocked,
    /// The job definition is gone; the trigger was moved to ERROR.
    JobMissing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FiredOutcome {
    Fired(FiredBundle),
    Skipped { trigger: TriggerKey, reason: SkipReason },
}

/// What to do with the trigger once its job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletedExecutionInstruction {
    /// Return the trigger to WAITING, or COMPLETE if it has no fire time left.
    #[default]
    Noop,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
}

impl JobStore {
    pub(super) fn store_job_in(
        &self,
        conn: &Connection,
        job: &JobRecord,
        replace_existing: bool,
    ) -> Result<()> {
        if self.delegate.job_exists(conn, &job.key)? {
            if !replace_existing {
                return Err(StoreError::ObjectAlreadyExists {
                    kind: "job",
                    key: job.key.to_string(),
                }
                .into());
            }
            self.delegate.update_job(conn, job)?;
        } else {
            self.delegate.insert_job(conn, job)?;
        }
        debug!(job = %job.key, "job stored");
        Ok(())
    }

    pub(super) fn store_trigger_in(
        &self,
        conn: &Connection,
        trigger: &TriggerRecord,
        replace_existing: bool,
    ) -> Result<()> {
        let exists = self.delegate.select_trigger_state(conn, &trigger.key)?.is_some();
        if exists && !replace_existing {
            return Err(StoreError::ObjectAlreadyExists {
                kind: "trigger",
                key: trigger.key.to_string(),
            }
            .into());
        }
        let Some(job) = self.delegate.select_job(conn, &trigger.job_key)? else {
            return Err(StoreError::JobNotFound {
                key: trigger.job_key.to_string(),
            }
            .into());
        };
        let mut stored = trigger.clone();
        stored.state = self.state_unless_blocked(conn, &job, TriggerState::Waiting)?;
        if exists {
            self.delegate.delete_trigger(conn, &trigger.key)?;
        }
        self.delegate.insert_trigger(conn, &stored)?;
        debug!(trigger = %stored.key, state = %stored.state, "trigger stored");
        Ok(())
    }

    pub(super) fn remove_trigger_in(&self, conn: &Connection, key: &TriggerKey) -> Result<bool> {
        let Some(trigger) = self.delegate.select_trigger(conn, key)? else {
            return Ok(false);
        };
        self.delegate.delete_trigger(conn, key)?;
        if let Some(job) = self.delegate.select_job(conn, &trigger.job_key)? {
            if !job.durable
                && self
                    .delegate
                    .select_trigger_keys_for_job(conn, &job.key)?
                    .is_empty()
            {
                self.delegate.delete_job(conn, &job.key)?;
                debug!(job = %job.key, "non-durable job removed with its last trigger");
            }
        }
        Ok(true)
    }

    pub(super) fn pause_trigger_in(&self, conn: &Connection, key: &TriggerKey) -> Result<bool> {
        let paused = self.delegate.update_trigger_state_from_other_states(
            conn,
            key,
            TriggerState::Paused,
            &[TriggerState::Waiting, TriggerState::Acquired],
        )? + self.delegate.update_trigger_state_from_other_states(
            conn,
            key,
            TriggerState::PausedBlocked,
            &[TriggerState::Blocked, TriggerState::Executing],
        )?;
        Ok(paused > 0)
    }

    pub(super) fn resume_trigger_in(&self, conn: &Connection, key: &TriggerKey) -> Result<bool> {
        let Some(mut trigger) = self.delegate.select_trigger(conn, key)? else {
            return Ok(false);
        };
        let old_state = trigger.state;
        if !old_state.is_paused() {
            return Ok(false);
        }
        let new_state = match self.delegate.select_job(conn, &trigger.job_key)? {
            Some(job) => self.state_unless_blocked(conn, &job, TriggerState::Waiting)?,
            None => TriggerState::Waiting,
        };
        if trigger.is_misfired(self.misfire_time(Utc::now())) {
            return self.apply_misfire_policy(conn, &mut trigger, new_state, &[old_state]);
        }
        let n = self
            .delegate
            .update_trigger_state_from_other_states(conn, key, new_state, &[old_state])?;
        Ok(n > 0)
    }

    pub(super) fn acquire_next_triggers_in(
        &self,
        conn: &Connection,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> Result<Vec<AcquiredTrigger>> {
        let mut acquired = Vec::new();
        let mut non_concurrent_jobs = HashSet::new();

        for _ in 0..MAX_ACQUIRE_SCANS {
            let now = Utc::now();
            let candidates = self.delegate.select_triggers_to_acquire(
                conn,
                no_later_than + time_window,
                self.misfire_time(now),
                max_count,
            )?;
            if candidates.is_empty() {
                break;
            }
            let mut batch_end = no_later_than;

            for key in candidates {
                let Some(mut trigger) = self.delegate.select_trigger(conn, &key)? else {
                    continue;
                };
                let Some(job) = self.delegate.select_job(conn, &trigger.job_key)? else {
                    warn!(trigger = %key, job = %trigger.job_key, "trigger references a missing job; moving to ERROR");
                    self.delegate.update_trigger_state_from_other_states(
                        conn,
                        &key,
                        TriggerState::Error,
                        &[TriggerState::Waiting],
                    )?;
                    continue;
                };
                if job.non_concurrent && !non_concurrent_jobs.insert(job.key.clone()) {
                    continue;
                }
                let Some(next_fire) = trigger.next_fire_time else {
                    continue;
                };
                if next_fire > batch_end {
                    break;
                }
                let claimed = self.delegate.update_trigger_state_from_other_states(
                    conn,
                    &key,
                    TriggerState::Acquired,
                    &[TriggerState::Waiting],
                )?;
                if claimed == 0 {
                    debug!(trigger = %key, "trigger acquired elsewhere");
                    continue;
                }
                trigger.state = TriggerState::Acquired;
                let entry_id = self.next_entry_id();
                self.delegate.insert_fired_trigger(
                    conn,
                    &FiredTriggerRecord {
                        entry_id: entry_id.clone(),
                        trigger_key: key.clone(),
                        job_key: job.key.clone(),
                        instance_id: self.instance_id.clone(),
                        fired_time: now,
                        scheduled_time: Some(next_fire),
                        priority: trigger.priority,
                        state: TriggerState::Acquired,
                        non_concurrent: job.non_concurrent,
                        requests_recovery: job.requests_recovery,
                    },
                )?;
                if acquired.is_empty() {
                    batch_end = next_fire.max(now) + time_window;
                }
                acquired.push(AcquiredTrigger { entry_id, trigger });
                if acquired.len() >= max_count {
                    break;
                }
            }

            if !acquired.is_empty() {
                break;
            }
        }
        if !acquired.is_empty() {
            debug!(count = acquired.len(), "triggers acquired");
        }
        Ok(acquired)
    }

    pub(super) fn release_acquired_trigger_in(
        &self,
        conn: &Connection,
        acquired: &AcquiredTrigger,
    ) -> Result<()> {
        self.delegate.update_trigger_state_from_other_states(
            conn,
            &acquired.trigger.key,
            TriggerState::Waiting,
            &[TriggerState::Acquired],
        )?;
        self.delegate.delete_fired_trigger(conn, &acquired.entry_id)?;
        Ok(())
    }

    pub(super) fn trigger_fired_in(
        &self,
        conn: &Connection,
        acquired: &AcquiredTrigger,
    ) -> Result<FiredOutcome> {
        let key = &acquired.trigger.key;
        let skipped = |reason| FiredOutcome::Skipped {
            trigger: key.clone(),
            reason,
        };

        let Some(mut trigger) = self.delegate.select_trigger(conn, key)? else {
            self.delegate.delete_fired_trigger(conn, &acquired.entry_id)?;
            return Ok(skipped(SkipReason::LostRace));
        };
        if trigger.state != TriggerState::Acquired {
            debug!(trigger = %key, state = %trigger.state, "trigger left ACQUIRED before firing");
            self.delegate.delete_fired_trigger(conn, &acquired.entry_id)?;
            return Ok(skipped(SkipReason::LostRace));
        }
        let Some(job) = self.delegate.select_job(conn, &trigger.job_key)? else {
            warn!(trigger = %key, job = %trigger.job_key, "job missing at fire time; moving trigger to ERROR");
            self.delegate.update_trigger_state_from_other_states(
                conn,
                key,
                TriggerState::Error,
                &[TriggerState::Acquired],
            )?;
            self.delegate.delete_fired_trigger(conn, &acquired.entry_id)?;
            return Ok(skipped(SkipReason::JobMissing));
        };
        if job.non_concurrent && self.delegate.count_executing_for_job(conn, &job.key)? > 0 {
            self.delegate.update_trigger_state_from_other_states(
                conn,
                key,
                TriggerState::Blocked,
                &[TriggerState::Acquired],
            )?;
            self.delegate.delete_fired_trigger(conn, &acquired.entry_id)?;
            return Ok(skipped(SkipReason::JobBlocked));
        }

        let fire_time = Utc::now();
        let scheduled_fire_time = trigger.next_fire_time;
        let previous_fire_time = trigger.previous_fire_time;
        self.delegate.update_fired_trigger(
            conn,
            &acquired.entry_id,
            TriggerState::Executing,
            fire_time,
            &job,
        )?;
        trigger.triggered();
        trigger.state = TriggerState::Executing;
        let moved = self
            .delegate
            .update_trigger_firing_state(conn, &trigger, &[TriggerState::Acquired])?;
        if moved == 0 {
            self.delegate.delete_fired_trigger(conn, &acquired.entry_id)?;
            return Ok(skipped(SkipReason::LostRace));
        }

        if job.non_concurrent {
            self.delegate.update_trigger_states_for_job_from_other_states(
                conn,
                &job.key,
                TriggerState::Blocked,
                &[TriggerState::Waiting, TriggerState::Acquired],
            )?;
            self.delegate.update_trigger_states_for_job_from_other_state(
                conn,
                &job.key,
                TriggerState::PausedBlocked,
                TriggerState::Paused,
            )?;
        }

        Ok(FiredOutcome::Fired(FiredBundle {
            entry_id: acquired.entry_id.clone(),
            trigger,
            job,
            fire_time,
            scheduled_fire_time,
            previous_fire_time,
        }))
    }

    pub(super) fn triggered_job_complete_in(
        &self,
        conn: &Connection,
        bundle: &FiredBundle,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let key = &bundle.trigger.key;
        let job_key = &bundle.job.key;
        match instruction {
            CompletedExecutionInstruction::Noop => {
                if let Some(stored) = self.delegate.select_trigger(conn, key)? {
                    let finished = if stored.next_fire_time.is_some() {
                        TriggerState::Waiting
                    } else {
                        TriggerState::Complete
                    };
                    let moved = self.delegate.update_trigger_state_from_other_states(
                        conn,
                        key,
                        finished,
                        &[TriggerState::Executing],
                    )?;
                    let unpaused = if finished == TriggerState::Complete {
                        TriggerState::Complete
                    } else {
                        TriggerState::Paused
                    };
                    let moved = moved
                        + self.delegate.update_trigger_state_from_other_states(
                            conn,
                            key,
                            unpaused,
                            &[TriggerState::PausedBlocked],
                        )?;
                    if moved > 0 && finished == TriggerState::Complete {
                        self.signaler.notify_trigger_finalized(key);
                    }
                }
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                // A trigger without a next fire time may have been rescheduled
                // while its job ran; only delete it if the stored copy agrees.
                let delete = match bundle.trigger.next_fire_time {
                    Some(_) => true,
                    None => self
                        .delegate
                        .select_trigger(conn, key)?
                        .is_some_and(|stored| stored.next_fire_time.is_none()),
                };
                if delete {
                    self.remove_trigger_in(conn, key)?;
                    self.signaler.notify_trigger_finalized(key);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete
            | CompletedExecutionInstruction::SetTriggerError => {
                let state = if instruction == CompletedExecutionInstruction::SetTriggerComplete {
                    TriggerState::Complete
                } else {
                    TriggerState::Error
                };
                self.delegate.update_trigger_state_from_other_states(
                    conn,
                    key,
                    state,
                    &TriggerState::LIVE,
                )?;
                info!(trigger = %key, %state, "trigger state set by job completion");
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete
            | CompletedExecutionInstruction::SetAllJobTriggersError => {
                let state =
                    if instruction == CompletedExecutionInstruction::SetAllJobTriggersComplete {
                        TriggerState::Complete
                    } else {
                        TriggerState::Error
                    };
                let n = self.delegate.update_trigger_states_for_job_from_other_states(
                    conn,
                    job_key,
                    state,
                    &TriggerState::LIVE,
                )?;
                info!(job = %job_key, %state, count = n, "job trigger states set by job completion");
            }
        }

        if bundle.job.non_concurrent {
            self.unblock_job_triggers(conn, job_key)?;
        }
        self.delegate.delete_fired_trigger(conn, &bundle.entry_id)?;
        Ok(())
    }

    /// BLOCKED → WAITING and PAUSED_BLOCKED → PAUSED for every trigger of `job`.
    pub(super) fn unblock_job_triggers(
        &self,
        conn: &Connection,
        job: &cadence_core::JobKey,
    ) -> Result<()> {
        self.delegate.update_trigger_states_for_job_from_other_state(
            conn,
            job,
            TriggerState::Waiting,
            TriggerState::Blocked,
        )?;
        self.delegate.update_trigger_states_for_job_from_other_state(
            conn,
            job,
            TriggerState::Paused,
            TriggerState::PausedBlocked,
        )?;
        Ok(())
    }

    /// `preferred`, or BLOCKED when `job` is non-concurrent and already executing.
    pub(super) fn state_unless_blocked(
        &self,
        conn: &Connection,
        job: &JobRecord,
        preferred: TriggerState,
    ) -> Result<TriggerState> {
        if job.non_concurrent && self.delegate.count_executing_for_job(conn, &job.key)? > 0 {
            Ok(match preferred {
                TriggerState::Paused => TriggerState::PausedBlocked,
                _ => TriggerState::Blocked,
            })
        } else {
            Ok(preferred)
        }
    }
}
