use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Shortest pause between two check-in passes.
pub const MIN_CHECKIN_PAUSE: Duration = Duration::from_millis(100);

/// Pause between misfire passes while a backlog remains, and the floor of
/// every misfire sleep.
pub const MISFIRE_BACKLOG_PAUSE: Duration = Duration::from_millis(50);

/// Counts consecutive failures of a periodic pass and throttles their logs.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    log_every: u32,
}

impl FailureTracker {
    pub fn new(log_every: u32) -> Self {
        Self {
            consecutive: 0,
            log_every: log_every.max(1),
        }
    }

    /// Count a failure. Returns whether this one should be logged: the
    /// first of a streak and every `log_every`-th after it.
    pub fn record_failure(&mut self) -> bool {
        let should_log = self.consecutive % self.log_every == 0;
        self.consecutive = self.consecutive.saturating_add(1);
        should_log
    }

    /// End a failure streak, returning how long it was.
    pub fn record_success(&mut self) -> u32 {
        std::mem::take(&mut self.consecutive)
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// How long the cluster manager waits before its next check-in.
pub fn next_checkin_delay(
    interval: Duration,
    elapsed_since_checkin: Duration,
    failures: u32,
    retry_interval: Duration,
) -> Duration {
    let delay = interval
        .saturating_sub(elapsed_since_checkin)
        .max(MIN_CHECKIN_PAUSE);
    if failures > 0 {
        delay.max(retry_interval)
    } else {
        delay
    }
}

/// How long the misfire handler waits before its next pass.
pub fn next_misfire_delay(
    threshold: Duration,
    pass_duration: Duration,
    has_more: bool,
    failures: u32,
    retry_interval: Duration,
) -> Duration {
    if has_more {
        return MISFIRE_BACKLOG_PAUSE;
    }
    let delay = threshold
        .saturating_sub(pass_duration)
        .max(MISFIRE_BACKLOG_PAUSE);
    if failures > 0 {
        delay.max(retry_interval)
    } else {
        delay
    }
}

/// Sleep for `duration` unless `token` fires first. Returns `true` if cancelled.
pub async fn cancellable_sleep(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_logs_are_throttled() {
        let mut tracker = FailureTracker::new(4);
        let logged: Vec<bool> = (0..9).map(|_| tracker.record_failure()).collect();
        assert_eq!(
            logged,
            [true, false, false, false, true, false, false, false, true]
        );
        assert_eq!(tracker.record_success(), 9);
        assert!(tracker.record_failure());
    }

    #[test]
    fn checkin_delay_has_floor_and_retry_interval() {
        let interval = Duration::from_secs(7);
        let retry = Duration::from_secs(15);
        assert_eq!(
            next_checkin_delay(interval, Duration::from_secs(2), 0, retry),
            Duration::from_secs(5)
        );
        assert_eq!(
            next_checkin_delay(interval, Duration::from_secs(9), 0, retry),
            MIN_CHECKIN_PAUSE
        );
        assert_eq!(next_checkin_delay(interval, Duration::ZERO, 1, retry), retry);
    }

    #[test]
    fn misfire_delay_shortens_for_backlog() {
        let threshold = Duration::from_secs(60);
        let retry = Duration::from_secs(15);
        assert_eq!(
            next_misfire_delay(threshold, Duration::from_secs(1), true, 0, retry),
            MISFIRE_BACKLOG_PAUSE
        );
        assert_eq!(
            next_misfire_delay(threshold, Duration::from_secs(1), false, 0, retry),
            Duration::from_secs(59)
        );
        assert_eq!(
            next_misfire_delay(Duration::from_secs(5), Duration::from_secs(1), false, 2, retry),
            retry
        );
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_early() {
        let token = CancellationToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        assert!(cancellable_sleep(&token, Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
