use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Names of the named store-wide locks.
pub const LOCK_NAMES: [&str; 2] = ["TRIGGER_ACCESS", "STATE_ACCESS"];

/// Fully qualified table names for one table prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub prefix: String,
    pub locks: String,
    pub scheduler_state: String,
    pub job_details: String,
    pub triggers: String,
    pub fired_triggers: String,
}

impl Tables {
    /// `prefix` must already be validated as `[A-Za-z0-9_]+`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            locks: format!("{prefix}locks"),
            scheduler_state: format!("{prefix}scheduler_state"),
            job_details: format!("{prefix}job_details"),
            triggers: format!("{prefix}triggers"),
            fired_triggers: format!("{prefix}fired_triggers"),
        }
    }
}

/// Initialise the coordination schema in `conn`.
///
/// Idempotent. Every table is keyed by scheduler name first so several
/// logical schedulers can share one database file.
pub fn init_db(conn: &Connection, tables: &Tables) -> Result<()> {
    let Tables {
        prefix,
        locks,
        scheduler_state,
        job_details,
        triggers,
        fired_triggers,
    } = tables;
    conn.execute_batch(&format!(
        "
        CREATE TABLE IF NOT EXISTS {locks} (
            sched_name  TEXT NOT NULL,
            lock_name   TEXT NOT NULL,
            PRIMARY KEY (sched_name, lock_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS {scheduler_state} (
            sched_name          TEXT    NOT NULL,
            instance_id         TEXT    NOT NULL,
            last_checkin_ms     INTEGER NOT NULL,
            checkin_interval_ms INTEGER NOT NULL,
            PRIMARY KEY (sched_name, instance_id)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS {job_details} (
            sched_name        TEXT    NOT NULL,
            job_name          TEXT    NOT NULL,
            job_group         TEXT    NOT NULL,
            description       TEXT,
            is_durable        INTEGER NOT NULL DEFAULT 0,
            is_nonconcurrent  INTEGER NOT NULL DEFAULT 0,
            requests_recovery INTEGER NOT NULL DEFAULT 0,
            job_data          TEXT,               -- JSON or NULL
            PRIMARY KEY (sched_name, job_name, job_group)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS {triggers} (
            sched_name         TEXT    NOT NULL,
            trigger_name       TEXT    NOT NULL,
            trigger_group      TEXT    NOT NULL,
            job_name           TEXT    NOT NULL,
            job_group          TEXT    NOT NULL,
            description        TEXT,
            schedule           TEXT    NOT NULL,  -- JSON-encoded Schedule enum
            start_time_ms      INTEGER NOT NULL,
            end_time_ms        INTEGER,
            next_fire_time_ms  INTEGER,           -- NULL once exhausted
            prev_fire_time_ms  INTEGER,
            priority           INTEGER NOT NULL DEFAULT 5,
            misfire_policy     TEXT    NOT NULL,
            trigger_state      TEXT    NOT NULL,
            times_triggered    INTEGER NOT NULL DEFAULT 0,
            job_data           TEXT,
            PRIMARY KEY (sched_name, trigger_name, trigger_group)
        ) STRICT;

        -- Acquisition and misfire scans: WHERE trigger_state = ? AND next_fire_time_ms <= ?
        CREATE INDEX IF NOT EXISTS {prefix}idx_triggers_state_next
            ON {triggers} (sched_name, trigger_state, next_fire_time_ms);
        CREATE INDEX IF NOT EXISTS {prefix}idx_triggers_job
            ON {triggers} (sched_name, job_name, job_group);

        CREATE TABLE IF NOT EXISTS {fired_triggers} (
            sched_name        TEXT    NOT NULL,
            entry_id          TEXT    NOT NULL,
            trigger_name      TEXT    NOT NULL,
            trigger_group     TEXT    NOT NULL,
            job_name          TEXT    NOT NULL,
            job_group         TEXT    NOT NULL,
            instance_id       TEXT    NOT NULL,
            fired_time_ms     INTEGER NOT NULL,
            sched_time_ms     INTEGER,
            priority          INTEGER NOT NULL,
            state             TEXT    NOT NULL,
            is_nonconcurrent  INTEGER NOT NULL DEFAULT 0,
            requests_recovery INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (sched_name, entry_id)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS {prefix}idx_fired_instance
            ON {fired_triggers} (sched_name, instance_id);
        CREATE INDEX IF NOT EXISTS {prefix}idx_fired_trigger
            ON {fired_triggers} (sched_name, trigger_name, trigger_group);
        CREATE INDEX IF NOT EXISTS {prefix}idx_fired_job
            ON {fired_triggers} (sched_name, job_name, job_group);
        "
    ))?;
    Ok(())
}

/// Insert one lock row per named lock for `sched_name`. Existing rows are kept.
pub fn provision_locks(conn: &Connection, tables: &Tables, sched_name: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!(
        "INSERT OR IGNORE INTO {} (sched_name, lock_name) VALUES (?1, ?2)",
        tables.locks
    ))?;
    let mut created = 0;
    for lock in LOCK_NAMES {
        created += stmt.execute(rusqlite::params![sched_name, lock])?;
    }
    if created > 0 {
        info!(scheduler = %sched_name, created, "lock rows provisioned");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_locks_are_unique() {
        let conn = Connection::open_in_memory().unwrap();
        let tables = Tables::new("t_");
        init_db(&conn, &tables).unwrap();
        init_db(&conn, &tables).unwrap();
        provision_locks(&conn, &tables, "sched").unwrap();
        provision_locks(&conn, &tables, "sched").unwrap();
        provision_locks(&conn, &tables, "other").unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM t_locks WHERE sched_name = 'sched'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, LOCK_NAMES.len() as i64);
    }
}
