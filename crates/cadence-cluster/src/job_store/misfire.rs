use cadence_store::{MisfireOutcome, TriggerRecord, TriggerState};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info, instrument};

use super::JobStore;
use crate::error::Result;
use crate::misfire::MisfireScanner;
use crate::semaphore::LockName;

/// Summary of one misfire-recovery pass. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoverMisfiredJobsResult {
    pub processed_count: usize,
    /// More misfired triggers remained than one pass may handle.
    pub has_more: bool,
    /// Earliest next fire time among the repaired triggers.
    pub earliest_new_time: Option<DateTime<Utc>>,
}

impl RecoverMisfiredJobsResult {
    pub const NO_OP: RecoverMisfiredJobsResult = RecoverMisfiredJobsResult {
        processed_count: 0,
        has_more: false,
        earliest_new_time: None,
    };
}

impl JobStore {
    /// One misfire pass: repair up to `max_per_pass` overdue WAITING triggers
    /// under TRIGGER_ACCESS.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub fn recover_misfires(&self) -> Result<RecoverMisfiredJobsResult> {
        let executor = &self.executor;
        if self.config.misfire.double_check_lock {
            let misfire_time = self.misfire_time(Utc::now());
            let overdue = executor.run_locked(None, |tx| {
                Ok(self.delegate.count_misfired_triggers_in_state(
                    tx.conn(),
                    TriggerState::Waiting,
                    misfire_time,
                )?)
            })?;
            if overdue == 0 {
                debug!("found 0 triggers that missed their scheduled fire-time");
                return Ok(RecoverMisfiredJobsResult::NO_OP);
            }
        }
        executor.run_locked(Some(LockName::TriggerAccess), |tx| {
            self.recover_misfired_jobs_in(tx.conn(), false)
        })
    }

    /// Select and repair misfired WAITING triggers. `recover_all` lifts the
    /// per-pass cap, as startup recovery does.
    pub(super) fn recover_misfired_jobs_in(
        &self,
        conn: &Connection,
        recover_all: bool,
    ) -> Result<RecoverMisfiredJobsResult> {
        let now = Utc::now();
        let max = self.config.misfire.max_per_pass;
        let limit = (!recover_all).then_some(max + 1);
        let mut keys = self.delegate.select_misfired_triggers_in_state(
            conn,
            TriggerState::Waiting,
            self.misfire_time(now),
            limit,
        )?;
        let has_more = !recover_all && keys.len() > max;
        keys.truncate(if recover_all { keys.len() } else { max });

        if keys.is_empty() {
            debug!("found 0 triggers that missed their scheduled fire-time");
            return Ok(RecoverMisfiredJobsResult::NO_OP);
        }
        if has_more {
            info!(
                count = keys.len(),
                "handling the first triggers that missed their scheduled fire-time; more remain"
            );
        } else {
            info!(count = keys.len(), "handling triggers that missed their scheduled fire-time");
        }

        let mut result = RecoverMisfiredJobsResult {
            has_more,
            ..RecoverMisfiredJobsResult::NO_OP
        };
        for key in keys {
            let Some(mut trigger) = self.delegate.select_trigger(conn, &key)? else {
                continue;
            };
            let new_state = match self.delegate.select_job(conn, &trigger.job_key)? {
                Some(job) => self.state_unless_blocked(conn, &job, TriggerState::Waiting)?,
                None => TriggerState::Waiting,
            };
            if !self.apply_misfire_policy(conn, &mut trigger, new_state, &[TriggerState::Waiting])? {
                continue;
            }
            result.processed_count += 1;
            if let Some(next) = trigger.next_fire_time {
                if trigger.state != TriggerState::Error
                    && result.earliest_new_time.map_or(true, |e| next < e)
                {
                    result.earliest_new_time = Some(next);
                }
            }
        }
        Ok(result)
    }

    /// Apply `trigger`'s misfire policy and write it back if its stored state
    /// is still one of `expected`.
    ///
    /// The trigger ends in `state_if_rescheduled`, COMPLETE when no fire time
    /// remains, or ERROR for the mark-error policy. Returns `false` on a lost race.
    pub(super) fn apply_misfire_policy(
        &self,
        conn: &Connection,
        trigger: &mut TriggerRecord,
        state_if_rescheduled: TriggerState,
        expected: &[TriggerState],
    ) -> Result<bool> {
        self.signaler.notify_trigger_misfired(trigger);
        let outcome = trigger.update_after_misfire(Utc::now());
        trigger.state = match outcome {
            MisfireOutcome::Rescheduled => state_if_rescheduled,
            MisfireOutcome::Exhausted => TriggerState::Complete,
            MisfireOutcome::Errored => TriggerState::Error,
        };
        let n = self
            .delegate
            .update_trigger_firing_state(conn, trigger, expected)?;
        if n == 0 {
            debug!(trigger = %trigger.key, "misfired trigger changed concurrently");
            return Ok(false);
        }
        debug!(trigger = %trigger.key, state = %trigger.state, next = ?trigger.next_fire_time, "misfire handled");
        if outcome == MisfireOutcome::Exhausted {
            self.signaler.notify_trigger_finalized(&trigger.key);
        }
        Ok(true)
    }
}

impl MisfireScanner for JobStore {
    fn recover_misfires(&self) -> Result<RecoverMisfiredJobsResult> {
        JobStore::recover_misfires(self)
    }
}
