use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Defines when and how often a trigger fires, relative to its start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once, at the trigger's start time.
    Once,

    /// Fire at `start + k * every_ms`. `repeat_count` limits the number of
    /// repeats after the first firing; `None` repeats forever.
    Interval {
        every_ms: i64,
        #[serde(default)]
        repeat_count: Option<u32>,
    },

    /// Fire every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Fire on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { day: u8, hour: u8, minute: u8 },
}

impl Schedule {
    /// Whether more than one fire time can exist.
    pub fn is_repeating(&self) -> bool {
        match self {
            Schedule::Once => false,
            Schedule::Interval { repeat_count, .. } => *repeat_count != Some(0),
            Schedule::Daily { .. } | Schedule::Weekly { .. } => true,
        }
    }

    /// The first fire time at or after `start`.
    pub fn first_fire_time(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.fire_time_after(start, start - Duration::milliseconds(1))
    }

    /// Compute the first fire time strictly *after* `after`, never earlier
    /// than `start`.
    ///
    /// Returns `None` once the schedule is exhausted.
    pub fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => (start > after).then_some(start),

            Schedule::Interval {
                every_ms,
                repeat_count,
            } => {
                if *every_ms <= 0 {
                    return (start > after).then_some(start);
                }
                let index = if after < start {
                    0
                } else {
                    let elapsed = (after - start).num_milliseconds();
                    elapsed / every_ms + 1
                };
                if let Some(limit) = repeat_count {
                    if index > i64::from(*limit) {
                        return None;
                    }
                }
                Some(start + Duration::milliseconds(index.checked_mul(*every_ms)?))
            }

            Schedule::Daily { hour, minute } => {
                let from = after.max(start - Duration::milliseconds(1));
                let candidate = at_hour_minute(from, *hour, *minute)?;
                if candidate > from {
                    Some(candidate)
                } else {
                    // Today's window has passed; advance to tomorrow.
                    Some(candidate + Duration::days(1))
                }
            }

            Schedule::Weekly { day, hour, minute } => {
                let from = after.max(start - Duration::milliseconds(1));
                let target_dow = i64::from((*day).min(6));
                let today_dow = i64::from(from.weekday().num_days_from_monday());
                let days_ahead = (target_dow - today_dow).rem_euclid(7);
                let candidate =
                    at_hour_minute(from, *hour, *minute)? + Duration::days(days_ahead);
                if candidate > from {
                    Some(candidate)
                } else {
                    // Same weekday but the time already passed.
                    Some(candidate + Duration::days(7))
                }
            }
        }
    }
}

fn at_hour_minute(day: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        day.year(),
        day.month(),
        day.day(),
        u32::from(hour),
        u32::from(minute),
        0,
    )
    .single()
}
