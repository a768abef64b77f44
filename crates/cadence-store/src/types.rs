use cadence_core::{InstanceId, JobKey, TriggerKey};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;

/// Group that holds the one-shot triggers created to re-run recovered jobs.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";

/// Persisted state of a trigger row (and of a fired-trigger row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Eligible for acquisition once its next fire time arrives.
    Waiting,
    /// Claimed by one instance for an upcoming firing.
    Acquired,
    /// Its job is running on some instance.
    Executing,
    /// No further fire times.
    Complete,
    /// Its non-concurrent job is running via another trigger.
    Blocked,
    /// Unrecoverable problem; ignored until an operator intervenes.
    Error,
    Paused,
    /// Paused while its non-concurrent job was running.
    PausedBlocked,
    Deleted,
}

impl TriggerState {
    /// Every state a stored trigger can still leave.
    pub const LIVE: [TriggerState; 6] = [
        TriggerState::Waiting,
        TriggerState::Acquired,
        TriggerState::Executing,
        TriggerState::Blocked,
        TriggerState::Paused,
        TriggerState::PausedBlocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::Error => "ERROR",
            TriggerState::Paused => "PAUSED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Deleted => "DELETED",
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TriggerState::Waiting),
            "ACQUIRED" => Ok(TriggerState::Acquired),
            "EXECUTING" => Ok(TriggerState::Executing),
            "COMPLETE" => Ok(TriggerState::Complete),
            "BLOCKED" => Ok(TriggerState::Blocked),
            "ERROR" => Ok(TriggerState::Error),
            "PAUSED" => Ok(TriggerState::Paused),
            "PAUSED_BLOCKED" => Ok(TriggerState::PausedBlocked),
            "DELETED" => Ok(TriggerState::Deleted),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// What a trigger does when its fire time passed without anyone firing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MisfirePolicy {
    /// One-shot schedules fire now, repeating schedules skip ahead.
    #[default]
    Smart,
    FireNow,
    SkipToNext,
    MarkError,
    /// Never treated as misfired; fires as soon as it is acquired.
    IgnoreMisfires,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::Smart => "smart",
            MisfirePolicy::FireNow => "fire-now",
            MisfirePolicy::SkipToNext => "skip-to-next",
            MisfirePolicy::MarkError => "mark-error",
            MisfirePolicy::IgnoreMisfires => "ignore-misfires",
        }
    }

    /// Replace `Smart` with the concrete policy for `schedule`.
    pub fn resolve(self, schedule: &Schedule) -> MisfirePolicy {
        match self {
            MisfirePolicy::Smart if schedule.is_repeating() => MisfirePolicy::SkipToNext,
            MisfirePolicy::Smart => MisfirePolicy::FireNow,
            other => other,
        }
    }
}

impl std::fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "smart" => Ok(MisfirePolicy::Smart),
            "fire-now" => Ok(MisfirePolicy::FireNow),
            "skip-to-next" => Ok(MisfirePolicy::SkipToNext),
            "mark-error" => Ok(MisfirePolicy::MarkError),
            "ignore-misfires" => Ok(MisfirePolicy::IgnoreMisfires),
            other => Err(format!("unknown misfire policy: {other}")),
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_column!(TriggerState);
text_column!(MisfirePolicy);

/// Result of applying a misfire policy to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfireOutcome {
    /// `next_fire_time` moved; the trigger stays fireable.
    Rescheduled,
    /// No fire time remains; the trigger is finished.
    Exhausted,
    /// The policy parks the trigger in `ERROR`.
    Errored,
}

/// A persisted trigger: definition plus mutable firing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub schedule: Schedule,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Higher fires first among triggers due at the same instant.
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub state: TriggerState,
    pub times_triggered: u32,
    /// Arbitrary JSON handed to the job alongside the job's own data.
    pub job_data: Option<serde_json::Value>,
}

impl TriggerRecord {
    pub const DEFAULT_PRIORITY: i32 = 5;

    pub fn new(
        key: TriggerKey,
        job_key: JobKey,
        schedule: Schedule,
        start_time: DateTime<Utc>,
    ) -> Self {
        let next_fire_time = schedule.first_fire_time(start_time);
        Self {
            key,
            job_key,
            description: None,
            schedule,
            start_time,
            end_time: None,
            next_fire_time,
            previous_fire_time: None,
            priority: Self::DEFAULT_PRIORITY,
            misfire_policy: MisfirePolicy::Smart,
            state: TriggerState::Waiting,
            times_triggered: 0,
            job_data: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self.next_fire_time = self.next_fire_time.filter(|t| *t <= end);
        self
    }

    pub fn with_job_data(mut self, data: serde_json::Value) -> Self {
        self.job_data = Some(data);
        self
    }

    /// Next fire time strictly after `after`, bounded by `end_time`.
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .fire_time_after(self.start_time, after)
            .filter(|t| self.end_time.map_or(true, |end| *t <= end))
    }

    /// Advance bookkeeping after a firing.
    pub fn triggered(&mut self) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = self.next_fire_time.and_then(|t| self.fire_time_after(t));
    }

    /// Whether the next fire time is older than `misfire_time`.
    pub fn is_misfired(&self, misfire_time: DateTime<Utc>) -> bool {
        self.misfire_policy != MisfirePolicy::IgnoreMisfires
            && self.next_fire_time.is_some_and(|t| t < misfire_time)
    }

    /// Apply this trigger's misfire policy as of `now`.
    pub fn update_after_misfire(&mut self, now: DateTime<Utc>) -> MisfireOutcome {
        match self.misfire_policy.resolve(&self.schedule) {
            MisfirePolicy::FireNow => {
                self.next_fire_time = Some(now);
            }
            MisfirePolicy::SkipToNext => {
                self.next_fire_time = self.fire_time_after(now);
            }
            MisfirePolicy::MarkError => return MisfireOutcome::Errored,
            MisfirePolicy::IgnoreMisfires | MisfirePolicy::Smart => {}
        }
        if self.next_fire_time.is_some() {
            MisfireOutcome::Rescheduled
        } else {
            MisfireOutcome::Exhausted
        }
    }
}

/// A job definition as far as coordination cares about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub description: Option<String>,
    /// Kept even when no trigger references it.
    pub durable: bool,
    /// At most one firing may be EXECUTING cluster-wide.
    pub non_concurrent: bool,
    /// Re-run when the instance executing it dies.
    pub requests_recovery: bool,
    pub job_data: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            description: None,
            durable: false,
            non_concurrent: false,
            requests_recovery: false,
            job_data: None,
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn non_concurrent(mut self) -> Self {
        self.non_concurrent = true;
        self
    }

    pub fn requests_recovery(mut self) -> Self {
        self.requests_recovery = true;
        self
    }
}

/// Bookkeeping row for one in-flight firing somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTriggerRecord {
    /// `<instance id>-<counter>`, unique per firing.
    pub entry_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_id: InstanceId,
    pub fired_time: DateTime<Utc>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub state: TriggerState,
    pub non_concurrent: bool,
    pub requests_recovery: bool,
}

/// Heartbeat row of one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStateRecord {
    pub instance_id: InstanceId,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

impl SchedulerStateRecord {
    /// Instant after which the instance counts as dead.
    pub fn failed_after(&self, tolerance_factor: f64) -> DateTime<Utc> {
        let allowance = (self.checkin_interval_ms as f64 * tolerance_factor).round() as i64;
        self.last_checkin + Duration::milliseconds(allowance)
    }

    pub fn is_alive(&self, now: DateTime<Utc>, tolerance_factor: f64) -> bool {
        now <= self.failed_after(tolerance_factor)
    }
}

pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(schedule: Schedule, policy: MisfirePolicy) -> TriggerRecord {
        let start = from_millis(1_000_000);
        TriggerRecord::new(TriggerKey::named("t"), JobKey::named("j"), schedule, start)
            .with_misfire_policy(policy)
    }

    #[test]
    fn state_roundtrips_through_text() {
        for state in TriggerState::LIVE {
            assert_eq!(state.as_str().parse::<TriggerState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<TriggerState>().is_err());
    }

    #[test]
    fn smart_policy_resolves_by_schedule() {
        assert_eq!(
            MisfirePolicy::Smart.resolve(&Schedule::Once),
            MisfirePolicy::FireNow
        );
        let daily = Schedule::Daily { hour: 1, minute: 0 };
        assert_eq!(MisfirePolicy::Smart.resolve(&daily), MisfirePolicy::SkipToNext);
    }

    #[test]
    fn fire_now_moves_next_fire_to_now() {
        let mut t = trigger(Schedule::Once, MisfirePolicy::FireNow);
        let now = from_millis(9_000_000);
        assert_eq!(t.update_after_misfire(now), MisfireOutcome::Rescheduled);
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn skip_to_next_on_exhausted_schedule_reports_exhausted() {
        let mut t = trigger(Schedule::Once, MisfirePolicy::SkipToNext);
        assert_eq!(
            t.update_after_misfire(from_millis(9_000_000)),
            MisfireOutcome::Exhausted
        );
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn mark_error_leaves_fire_time_alone() {
        let mut t = trigger(Schedule::Once, MisfirePolicy::MarkError);
        let before = t.next_fire_time;
        assert_eq!(
            t.update_after_misfire(from_millis(9_000_000)),
            MisfireOutcome::Errored
        );
        assert_eq!(t.next_fire_time, before);
    }

    #[test]
    fn triggered_advances_interval() {
        let mut t = trigger(
            Schedule::Interval {
                every_ms: 1_000,
                repeat_count: None,
            },
            MisfirePolicy::Smart,
        );
        t.triggered();
        assert_eq!(t.times_triggered, 1);
        assert_eq!(t.previous_fire_time, Some(from_millis(1_000_000)));
        assert_eq!(t.next_fire_time, Some(from_millis(1_001_000)));
    }

    #[test]
    fn ignore_misfires_is_never_misfired() {
        let t = trigger(Schedule::Once, MisfirePolicy::IgnoreMisfires);
        assert!(!t.is_misfired(from_millis(99_000_000)));
    }

    #[test]
    fn staleness_uses_tolerance_factor() {
        let rec = SchedulerStateRecord {
            instance_id: InstanceId::from("a"),
            last_checkin: from_millis(100_000),
            checkin_interval_ms: 1_000,
        };
        assert!(rec.is_alive(from_millis(102_000), 2.0));
        assert!(!rec.is_alive(from_millis(102_001), 2.0));
    }
}
