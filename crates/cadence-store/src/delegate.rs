use std::collections::BTreeSet;

use cadence_core::{InstanceId, JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::db::Tables;
use crate::error::{Result, StoreError};
use crate::types::{
    from_millis, to_millis, FiredTriggerRecord, JobRecord, SchedulerStateRecord, TriggerRecord,
    TriggerState,
};

const TRIGGER_COLUMNS: &str = "trigger_name, trigger_group, job_name, job_group, description,
    schedule, start_time_ms, end_time_ms, next_fire_time_ms, prev_fire_time_ms, priority,
    misfire_policy, trigger_state, times_triggered, job_data";

const FIRED_COLUMNS: &str = "entry_id, trigger_name, trigger_group, job_name, job_group,
    instance_id, fired_time_ms, sched_time_ms, priority, state, is_nonconcurrent,
    requests_recovery";

const JOB_COLUMNS: &str =
    "job_name, job_group, description, is_durable, is_nonconcurrent, requests_recovery, job_data";

/// Typed row operations against the coordination tables of one scheduler.
///
/// Every state change is a compare-and-set: `SET state = new WHERE ... AND
/// state IN (old...)`. Callers get the affected-row count back; zero means
/// another actor changed the row first, which is not an error.
#[derive(Debug, Clone)]
pub struct StoreDelegate {
    tables: Tables,
    sched_name: String,
}

impl StoreDelegate {
    pub fn new(tables: Tables, sched_name: impl Into<String>) -> Self {
        Self {
            tables,
            sched_name: sched_name.into(),
        }
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn scheduler_name(&self) -> &str {
        &self.sched_name
    }

    // --- scheduler state ---------------------------------------------------

    pub fn insert_scheduler_state(
        &self,
        conn: &Connection,
        instance: &InstanceId,
        checkin: DateTime<Utc>,
        checkin_interval_ms: i64,
    ) -> Result<()> {
        conn.prepare_cached(&format!(
            "INSERT INTO {} (sched_name, instance_id, last_checkin_ms, checkin_interval_ms)
             VALUES (?1, ?2, ?3, ?4)",
            self.tables.scheduler_state
        ))?
        .execute(params![
            self.sched_name,
            instance.as_str(),
            to_millis(checkin),
            checkin_interval_ms
        ])
        .map_err(|e| already_exists(e, "scheduler state", instance.as_str()))?;
        Ok(())
    }

    pub fn update_scheduler_state(
        &self,
        conn: &Connection,
        instance: &InstanceId,
        checkin: DateTime<Utc>,
        checkin_interval_ms: i64,
    ) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "UPDATE {} SET last_checkin_ms = ?1, checkin_interval_ms = ?2
                 WHERE sched_name = ?3 AND instance_id = ?4",
                self.tables.scheduler_state
            ))?
            .execute(params![
                to_millis(checkin),
                checkin_interval_ms,
                self.sched_name,
                instance.as_str()
            ])?;
        Ok(n)
    }

    pub fn select_scheduler_state_records(
        &self,
        conn: &Connection,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT instance_id, last_checkin_ms, checkin_interval_ms FROM {}
             WHERE sched_name = ?1 ORDER BY instance_id",
            self.tables.scheduler_state
        ))?;
        let rows = stmt.query_map([&self.sched_name], |row| {
            Ok(SchedulerStateRecord {
                instance_id: InstanceId(row.get(0)?),
                last_checkin: from_millis(row.get(1)?),
                checkin_interval_ms: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_scheduler_state(&self, conn: &Connection, instance: &InstanceId) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE sched_name = ?1 AND instance_id = ?2",
                self.tables.scheduler_state
            ))?
            .execute(params![self.sched_name, instance.as_str()])?;
        Ok(n)
    }

    // --- jobs --------------------------------------------------------------

    pub fn insert_job(&self, conn: &Connection, job: &JobRecord) -> Result<()> {
        let data = job.job_data.as_ref().map(serde_json::to_string).transpose()?;
        conn.prepare_cached(&format!(
            "INSERT INTO {} (sched_name, {JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            self.tables.job_details
        ))?
        .execute(params![
            self.sched_name,
            job.key.name,
            job.key.group,
            job.description,
            job.durable,
            job.non_concurrent,
            job.requests_recovery,
            data
        ])
        .map_err(|e| already_exists(e, "job", &job.key.to_string()))?;
        Ok(())
    }

    pub fn update_job(&self, conn: &Connection, job: &JobRecord) -> Result<usize> {
        let data = job.job_data.as_ref().map(serde_json::to_string).transpose()?;
        let n = conn
            .prepare_cached(&format!(
                "UPDATE {} SET description = ?1, is_durable = ?2, is_nonconcurrent = ?3,
                        requests_recovery = ?4, job_data = ?5
                 WHERE sched_name = ?6 AND job_name = ?7 AND job_group = ?8",
                self.tables.job_details
            ))?
            .execute(params![
                job.description,
                job.durable,
                job.non_concurrent,
                job.requests_recovery,
                data,
                self.sched_name,
                job.key.name,
                job.key.group
            ])?;
        Ok(n)
    }

    pub fn select_job(&self, conn: &Connection, key: &JobKey) -> Result<Option<JobRecord>> {
        let job = conn
            .prepare_cached(&format!(
                "SELECT {JOB_COLUMNS} FROM {}
                 WHERE sched_name = ?1 AND job_name = ?2 AND job_group = ?3",
                self.tables.job_details
            ))?
            .query_row(params![self.sched_name, key.name, key.group], row_to_job)
            .optional()?;
        Ok(job)
    }

    pub fn job_exists(&self, conn: &Connection, key: &JobKey) -> Result<bool> {
        let found = conn
            .prepare_cached(&format!(
                "SELECT 1 FROM {} WHERE sched_name = ?1 AND job_name = ?2 AND job_group = ?3",
                self.tables.job_details
            ))?
            .exists(params![self.sched_name, key.name, key.group])?;
        Ok(found)
    }

    pub fn delete_job(&self, conn: &Connection, key: &JobKey) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE sched_name = ?1 AND job_name = ?2 AND job_group = ?3",
                self.tables.job_details
            ))?
            .execute(params![self.sched_name, key.name, key.group])?;
        Ok(n)
    }

    // --- triggers ----------------------------------------------------------

    pub fn insert_trigger(&self, conn: &Connection, trigger: &TriggerRecord) -> Result<()> {
        let schedule = serde_json::to_string(&trigger.schedule)?;
        let data = trigger
            .job_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.prepare_cached(&format!(
            "INSERT INTO {} (sched_name, {TRIGGER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            self.tables.triggers
        ))?
        .execute(params![
            self.sched_name,
            trigger.key.name,
            trigger.key.group,
            trigger.job_key.name,
            trigger.job_key.group,
            trigger.description,
            schedule,
            to_millis(trigger.start_time),
            trigger.end_time.map(to_millis),
            trigger.next_fire_time.map(to_millis),
            trigger.previous_fire_time.map(to_millis),
            trigger.priority,
            trigger.misfire_policy,
            trigger.state,
            trigger.times_triggered,
            data
        ])
        .map_err(|e| already_exists(e, "trigger", &trigger.key.to_string()))?;
        Ok(())
    }

    pub fn select_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<Option<TriggerRecord>> {
        let trigger = conn
            .prepare_cached(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM {}
                 WHERE sched_name = ?1 AND trigger_name = ?2 AND trigger_group = ?3",
                self.tables.triggers
            ))?
            .query_row(params![self.sched_name, key.name, key.group], row_to_trigger)
            .optional()?;
        Ok(trigger)
    }

    pub fn select_trigger_state(
        &self,
        conn: &Connection,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>> {
        let state = conn
            .prepare_cached(&format!(
                "SELECT trigger_state FROM {}
                 WHERE sched_name = ?1 AND trigger_name = ?2 AND trigger_group = ?3",
                self.tables.triggers
            ))?
            .query_row(params![self.sched_name, key.name, key.group], |row| row.get(0))
            .optional()?;
        Ok(state)
    }

    pub fn select_trigger_keys_for_job(&self, conn: &Connection, job: &JobKey) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT trigger_name, trigger_group FROM {}
             WHERE sched_name = ?1 AND job_name = ?2 AND job_group = ?3",
            self.tables.triggers
        ))?;
        let rows = stmt.query_map(params![self.sched_name, job.name, job.group], row_to_trigger_key)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn select_trigger_keys_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
    ) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT trigger_name, trigger_group FROM {}
             WHERE sched_name = ?1 AND trigger_state = ?2",
            self.tables.triggers
        ))?;
        let rows = stmt.query_map(params![self.sched_name, state], row_to_trigger_key)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_trigger(&self, conn: &Connection, key: &TriggerKey) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE sched_name = ?1 AND trigger_name = ?2 AND trigger_group = ?3",
                self.tables.triggers
            ))?
            .execute(params![self.sched_name, key.name, key.group])?;
        Ok(n)
    }

    /// `SET trigger_state = new WHERE key AND trigger_state IN (old...)`.
    pub fn update_trigger_state_from_other_states(
        &self,
        conn: &Connection,
        key: &TriggerKey,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET trigger_state = ?1
             WHERE sched_name = ?2 AND trigger_name = ?3 AND trigger_group = ?4
               AND trigger_state IN ({})",
            self.tables.triggers,
            placeholders(5, old_states.len())
        );
        let mut values = vec![
            Value::from(new_state.as_str().to_string()),
            Value::from(self.sched_name.clone()),
            Value::from(key.name.clone()),
            Value::from(key.group.clone()),
        ];
        values.extend(old_states.iter().map(state_value));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(values))?)
    }

    /// Compare-and-set every trigger of `job` from `old_state` to `new_state`.
    pub fn update_trigger_states_for_job_from_other_state(
        &self,
        conn: &Connection,
        job: &JobKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "UPDATE {} SET trigger_state = ?1
                 WHERE sched_name = ?2 AND job_name = ?3 AND job_group = ?4
                   AND trigger_state = ?5",
                self.tables.triggers
            ))?
            .execute(params![new_state, self.sched_name, job.name, job.group, old_state])?;
        Ok(n)
    }

    /// Compare-and-set every trigger of `job` in any of `old_states`.
    pub fn update_trigger_states_for_job_from_other_states(
        &self,
        conn: &Connection,
        job: &JobKey,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET trigger_state = ?1
             WHERE sched_name = ?2 AND job_name = ?3 AND job_group = ?4
               AND trigger_state IN ({})",
            self.tables.triggers,
            placeholders(5, old_states.len())
        );
        let mut values = vec![
            Value::from(new_state.as_str().to_string()),
            Value::from(self.sched_name.clone()),
            Value::from(job.name.clone()),
            Value::from(job.group.clone()),
        ];
        values.extend(old_states.iter().map(state_value));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(values))?)
    }

    /// Compare-and-set every trigger of this scheduler in any of `old_states`.
    pub fn update_trigger_states_from_other_states(
        &self,
        conn: &Connection,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET trigger_state = ?1
             WHERE sched_name = ?2 AND trigger_state IN ({})",
            self.tables.triggers,
            placeholders(3, old_states.len())
        );
        let mut values = vec![
            Value::from(new_state.as_str().to_string()),
            Value::from(self.sched_name.clone()),
        ];
        values.extend(old_states.iter().map(state_value));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(values))?)
    }

    /// Move triggers in any of `old_states` that have no next fire time to COMPLETE.
    pub fn complete_exhausted_triggers(
        &self,
        conn: &Connection,
        old_states: &[TriggerState],
    ) -> Result<usize> {
        if old_states.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET trigger_state = ?1
             WHERE sched_name = ?2 AND next_fire_time_ms IS NULL AND trigger_state IN ({})",
            self.tables.triggers,
            placeholders(3, old_states.len())
        );
        let mut values = vec![
            state_value(&TriggerState::Complete),
            Value::from(self.sched_name.clone()),
        ];
        values.extend(old_states.iter().map(state_value));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(values))?)
    }

    /// Write `trigger`'s state and fire times if its stored state is one of
    /// `expected`. The stored state becomes `trigger.state`.
    pub fn update_trigger_firing_state(
        &self,
        conn: &Connection,
        trigger: &TriggerRecord,
        expected: &[TriggerState],
    ) -> Result<usize> {
        if expected.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET trigger_state = ?1, next_fire_time_ms = ?2, prev_fire_time_ms = ?3,
                    times_triggered = ?4
             WHERE sched_name = ?5 AND trigger_name = ?6 AND trigger_group = ?7
               AND trigger_state IN ({})",
            self.tables.triggers,
            placeholders(8, expected.len())
        );
        let mut values = vec![
            state_value(&trigger.state),
            trigger.next_fire_time.map(to_millis).into(),
            trigger.previous_fire_time.map(to_millis).into(),
            Value::from(i64::from(trigger.times_triggered)),
            Value::from(self.sched_name.clone()),
            Value::from(trigger.key.name.clone()),
            Value::from(trigger.key.group.clone()),
        ];
        values.extend(expected.iter().map(state_value));
        Ok(conn.prepare_cached(&sql)?.execute(params_from_iter(values))?)
    }

    /// WAITING triggers due by `no_later_than` that are not yet misfired,
    /// earliest first, higher priority first among equals.
    pub fn select_triggers_to_acquire(
        &self,
        conn: &Connection,
        no_later_than: DateTime<Utc>,
        misfire_time: DateTime<Utc>,
        max_count: usize,
    ) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT trigger_name, trigger_group FROM {}
             WHERE sched_name = ?1 AND trigger_state = ?2
               AND next_fire_time_ms <= ?3
               AND (misfire_policy = 'ignore-misfires' OR next_fire_time_ms >= ?4)
             ORDER BY next_fire_time_ms ASC, priority DESC
             LIMIT ?5",
            self.tables.triggers
        ))?;
        let rows = stmt.query_map(
            params![
                self.sched_name,
                TriggerState::Waiting,
                to_millis(no_later_than),
                to_millis(misfire_time),
                limit_value(Some(max_count))
            ],
            row_to_trigger_key,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_misfired_triggers_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
    ) -> Result<usize> {
        let count: i64 = conn
            .prepare_cached(&format!(
                "SELECT COUNT(*) FROM {}
                 WHERE sched_name = ?1 AND trigger_state = ?2
                   AND misfire_policy <> 'ignore-misfires'
                   AND next_fire_time_ms < ?3",
                self.tables.triggers
            ))?
            .query_row(params![self.sched_name, state, to_millis(misfire_time)], |row| {
                row.get(0)
            })?;
        Ok(count.max(0) as usize)
    }

    /// Misfired triggers in `state`, longest overdue first. `limit: None`
    /// returns all of them.
    pub fn select_misfired_triggers_in_state(
        &self,
        conn: &Connection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT trigger_name, trigger_group FROM {}
             WHERE sched_name = ?1 AND trigger_state = ?2
               AND misfire_policy <> 'ignore-misfires'
               AND next_fire_time_ms < ?3
             ORDER BY next_fire_time_ms ASC, priority DESC
             LIMIT ?4",
            self.tables.triggers
        ))?;
        let rows = stmt.query_map(
            params![
                self.sched_name,
                state,
                to_millis(misfire_time),
                limit_value(limit)
            ],
            row_to_trigger_key,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // --- fired triggers ----------------------------------------------------

    pub fn insert_fired_trigger(&self, conn: &Connection, fired: &FiredTriggerRecord) -> Result<()> {
        conn.prepare_cached(&format!(
            "INSERT INTO {} (sched_name, {FIRED_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            self.tables.fired_triggers
        ))?
        .execute(params![
            self.sched_name,
            fired.entry_id,
            fired.trigger_key.name,
            fired.trigger_key.group,
            fired.job_key.name,
            fired.job_key.group,
            fired.instance_id.as_str(),
            to_millis(fired.fired_time),
            fired.scheduled_time.map(to_millis),
            fired.priority,
            fired.state,
            fired.non_concurrent,
            fired.requests_recovery
        ])
        .map_err(|e| already_exists(e, "fired trigger", &fired.entry_id))?;
        Ok(())
    }

    /// Advance a fired record; refreshes the job flags captured at firing.
    pub fn update_fired_trigger(
        &self,
        conn: &Connection,
        entry_id: &str,
        state: TriggerState,
        fired_time: DateTime<Utc>,
        job: &JobRecord,
    ) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "UPDATE {} SET state = ?1, fired_time_ms = ?2, is_nonconcurrent = ?3,
                        requests_recovery = ?4
                 WHERE sched_name = ?5 AND entry_id = ?6",
                self.tables.fired_triggers
            ))?
            .execute(params![
                state,
                to_millis(fired_time),
                job.non_concurrent,
                job.requests_recovery,
                self.sched_name,
                entry_id
            ])?;
        Ok(n)
    }

    pub fn select_fired_trigger_records_for_instance(
        &self,
        conn: &Connection,
        instance: &InstanceId,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FIRED_COLUMNS} FROM {}
             WHERE sched_name = ?1 AND instance_id = ?2 ORDER BY fired_time_ms",
            self.tables.fired_triggers
        ))?;
        let rows = stmt.query_map(params![self.sched_name, instance.as_str()], row_to_fired)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn select_fired_trigger_records_for_trigger(
        &self,
        conn: &Connection,
        key: &TriggerKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {FIRED_COLUMNS} FROM {}
             WHERE sched_name = ?1 AND trigger_name = ?2 AND trigger_group = ?3",
            self.tables.fired_triggers
        ))?;
        let rows = stmt.query_map(params![self.sched_name, key.name, key.group], row_to_fired)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Instance ids that currently own at least one fired record.
    pub fn select_fired_trigger_instance_ids(&self, conn: &Connection) -> Result<BTreeSet<String>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT DISTINCT instance_id FROM {} WHERE sched_name = ?1",
            self.tables.fired_triggers
        ))?;
        let rows = stmt.query_map([&self.sched_name], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Firings of `job` currently in EXECUTING anywhere in the cluster.
    pub fn count_executing_for_job(&self, conn: &Connection, job: &JobKey) -> Result<usize> {
        let count: i64 = conn
            .prepare_cached(&format!(
                "SELECT COUNT(*) FROM {}
                 WHERE sched_name = ?1 AND job_name = ?2 AND job_group = ?3 AND state = ?4",
                self.tables.fired_triggers
            ))?
            .query_row(
                params![self.sched_name, job.name, job.group, TriggerState::Executing],
                |row| row.get(0),
            )?;
        Ok(count.max(0) as usize)
    }

    pub fn delete_fired_trigger(&self, conn: &Connection, entry_id: &str) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE sched_name = ?1 AND entry_id = ?2",
                self.tables.fired_triggers
            ))?
            .execute(params![self.sched_name, entry_id])?;
        Ok(n)
    }

    pub fn delete_fired_triggers_for_instance(
        &self,
        conn: &Connection,
        instance: &InstanceId,
    ) -> Result<usize> {
        let n = conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE sched_name = ?1 AND instance_id = ?2",
                self.tables.fired_triggers
            ))?
            .execute(params![self.sched_name, instance.as_str()])?;
        Ok(n)
    }
}

// --- row mapping -----------------------------------------------------------

fn row_to_trigger_key(row: &Row<'_>) -> rusqlite::Result<TriggerKey> {
    Ok(TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
}

fn row_to_trigger(row: &Row<'_>) -> rusqlite::Result<TriggerRecord> {
    Ok(TriggerRecord {
        key: TriggerKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        job_key: JobKey::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
        description: row.get(4)?,
        schedule: json_column(row, 5)?,
        start_time: from_millis(row.get(6)?),
        end_time: row.get::<_, Option<i64>>(7)?.map(from_millis),
        next_fire_time: row.get::<_, Option<i64>>(8)?.map(from_millis),
        previous_fire_time: row.get::<_, Option<i64>>(9)?.map(from_millis),
        priority: row.get(10)?,
        misfire_policy: row.get(11)?,
        state: row.get(12)?,
        times_triggered: row.get(13)?,
        job_data: optional_json_column(row, 14)?,
    })
}

fn row_to_fired(row: &Row<'_>) -> rusqlite::Result<FiredTriggerRecord> {
    Ok(FiredTriggerRecord {
        entry_id: row.get(0)?,
        trigger_key: TriggerKey::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        job_key: JobKey::new(row.get::<_, String>(3)?, row.get::<_, String>(4)?),
        instance_id: InstanceId(row.get(5)?),
        fired_time: from_millis(row.get(6)?),
        scheduled_time: row.get::<_, Option<i64>>(7)?.map(from_millis),
        priority: row.get(8)?,
        state: row.get(9)?,
        non_concurrent: row.get(10)?,
        requests_recovery: row.get(11)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        key: JobKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
        description: row.get(2)?,
        durable: row.get(3)?,
        non_concurrent: row.get(4)?,
        requests_recovery: row.get(5)?,
        job_data: optional_json_column(row, 6)?,
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

// --- helpers ---------------------------------------------------------------

/// `?first, ?first+1, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn state_value(state: &TriggerState) -> Value {
    Value::from(state.as_str().to_string())
}

/// SQLite treats a negative LIMIT as "no limit".
fn limit_value(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX))
}

fn already_exists(err: rusqlite::Error, kind: &'static str, key: &str) -> StoreError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        StoreError::ObjectAlreadyExists {
            kind,
            key: key.to_string(),
        }
    } else {
        StoreError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, Tables};
    use crate::schedule::Schedule;
    use chrono::Duration;

    fn setup() -> (Connection, StoreDelegate) {
        let conn = Connection::open_in_memory().unwrap();
        let tables = Tables::new("t_");
        init_db(&conn, &tables).unwrap();
        (conn, StoreDelegate::new(tables, "sched"))
    }

    fn trigger(name: &str, next: DateTime<Utc>) -> TriggerRecord {
        TriggerRecord::new(TriggerKey::named(name), JobKey::named("job"), Schedule::Once, next)
    }

    #[test]
    fn trigger_roundtrip_preserves_fields() {
        let (conn, delegate) = setup();
        let now = from_millis(to_millis(Utc::now()));
        let t = trigger("a", now)
            .with_priority(9)
            .with_job_data(serde_json::json!({"k": 1}));
        delegate.insert_trigger(&conn, &t).unwrap();
        let back = delegate.select_trigger(&conn, &t.key).unwrap().unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn duplicate_trigger_is_already_exists() {
        let (conn, delegate) = setup();
        let t = trigger("a", Utc::now());
        delegate.insert_trigger(&conn, &t).unwrap();
        let err = delegate.insert_trigger(&conn, &t).unwrap_err();
        assert!(matches!(err, StoreError::ObjectAlreadyExists { kind: "trigger", .. }));
    }

    #[test]
    fn state_cas_is_noop_when_state_differs() {
        let (conn, delegate) = setup();
        let t = trigger("a", Utc::now());
        delegate.insert_trigger(&conn, &t).unwrap();

        let moved = delegate
            .update_trigger_state_from_other_states(
                &conn,
                &t.key,
                TriggerState::Acquired,
                &[TriggerState::Waiting],
            )
            .unwrap();
        assert_eq!(moved, 1);
        let lost = delegate
            .update_trigger_state_from_other_states(
                &conn,
                &t.key,
                TriggerState::Acquired,
                &[TriggerState::Waiting],
            )
            .unwrap();
        assert_eq!(lost, 0);
        assert_eq!(
            delegate.select_trigger_state(&conn, &t.key).unwrap(),
            Some(TriggerState::Acquired)
        );
    }

    #[test]
    fn misfire_scan_orders_oldest_first_and_skips_ignored() {
        let (conn, delegate) = setup();
        let now = Utc::now();
        delegate
            .insert_trigger(&conn, &trigger("newer", now - Duration::minutes(5)))
            .unwrap();
        delegate
            .insert_trigger(&conn, &trigger("older", now - Duration::minutes(50)))
            .unwrap();
        delegate
            .insert_trigger(
                &conn,
                &trigger("ignored", now - Duration::minutes(90))
                    .with_misfire_policy(crate::types::MisfirePolicy::IgnoreMisfires),
            )
            .unwrap();
        delegate
            .insert_trigger(&conn, &trigger("future", now + Duration::minutes(5)))
            .unwrap();

        let misfire_time = now - Duration::minutes(1);
        let keys = delegate
            .select_misfired_triggers_in_state(&conn, TriggerState::Waiting, misfire_time, None)
            .unwrap();
        let names: Vec<_> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["older", "newer"]);
        assert_eq!(
            delegate
                .count_misfired_triggers_in_state(&conn, TriggerState::Waiting, misfire_time)
                .unwrap(),
            2
        );
        let capped = delegate
            .select_misfired_triggers_in_state(&conn, TriggerState::Waiting, misfire_time, Some(1))
            .unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn acquisition_scan_excludes_misfired_but_keeps_ignore_policy() {
        let (conn, delegate) = setup();
        let now = Utc::now();
        delegate
            .insert_trigger(&conn, &trigger("due", now - Duration::seconds(1)))
            .unwrap();
        delegate
            .insert_trigger(&conn, &trigger("misfired", now - Duration::hours(1)))
            .unwrap();
        delegate
            .insert_trigger(
                &conn,
                &trigger("ignored", now - Duration::hours(2))
                    .with_misfire_policy(crate::types::MisfirePolicy::IgnoreMisfires),
            )
            .unwrap();

        let keys = delegate
            .select_triggers_to_acquire(&conn, now, now - Duration::minutes(1), 10)
            .unwrap();
        let names: Vec<_> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["ignored", "due"]);
    }

    #[test]
    fn scheduler_state_update_reports_missing_row() {
        let (conn, delegate) = setup();
        let id = InstanceId::from("node-a");
        let now = Utc::now();
        assert_eq!(delegate.update_scheduler_state(&conn, &id, now, 1_000).unwrap(), 0);
        delegate.insert_scheduler_state(&conn, &id, now, 1_000).unwrap();
        assert_eq!(delegate.update_scheduler_state(&conn, &id, now, 1_000).unwrap(), 1);
        let records = delegate.select_scheduler_state_records(&conn).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_id, id);
    }
}
