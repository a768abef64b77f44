use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ClusterError, Result};
use crate::pacing::{cancellable_sleep, next_checkin_delay, FailureTracker};
use crate::signal::SchedulerSignaler;

/// What the cluster manager needs from the store.
pub trait ClusterScanner: Send + Sync + 'static {
    /// Heartbeat and recover failed instances. Returns whether anything was recovered.
    fn check_in(&self) -> Result<bool>;

    /// Remove this instance's heartbeat on clean shutdown.
    fn check_out(&self) -> Result<()>;
}

/// Periodic heartbeat and failed-instance recovery for one instance.
pub struct ClusterManager {
    scanner: Arc<dyn ClusterScanner>,
    signaler: Arc<dyn SchedulerSignaler>,
    checkin_interval: Duration,
    retry_interval: Duration,
    failures: FailureTracker,
}

impl ClusterManager {
    pub fn new(
        scanner: Arc<dyn ClusterScanner>,
        signaler: Arc<dyn SchedulerSignaler>,
        checkin_interval: Duration,
        retry_interval: Duration,
        failure_log_every: u32,
    ) -> Self {
        Self {
            scanner,
            signaler,
            checkin_interval,
            retry_interval,
            failures: FailureTracker::new(failure_log_every),
        }
    }

    /// Run the first check-in, then spawn the loop. The loop stops when
    /// `shutdown` or the returned handle is cancelled.
    pub async fn start(mut self, shutdown: &CancellationToken) -> ClusterManagerHandle {
        let last_checkin = Instant::now();
        if self.manage().await {
            self.signaler.signal_scheduling_change(None);
        }
        let token = shutdown.child_token();
        let task = tokio::spawn(self.run(token.clone(), last_checkin));
        info!("cluster manager started");
        ClusterManagerHandle { token, task }
    }

    async fn run(mut self, token: CancellationToken, mut last_checkin: Instant) {
        loop {
            let delay = next_checkin_delay(
                self.checkin_interval,
                last_checkin.elapsed(),
                self.failures.consecutive(),
                self.retry_interval,
            );
            if cancellable_sleep(&token, delay).await {
                break;
            }
            last_checkin = Instant::now();
            if self.manage().await {
                self.signaler.signal_scheduling_change(None);
            }
        }

        let scanner = Arc::clone(&self.scanner);
        match tokio::task::spawn_blocking(move || scanner.check_out()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "cluster check-out failed"),
            Err(e) => warn!(error = %e, "cluster check-out task failed"),
        }
        info!("cluster manager stopped");
    }

    /// One check-in pass. Failures are counted and logged, never returned.
    async fn manage(&mut self) -> bool {
        let scanner = Arc::clone(&self.scanner);
        let outcome = tokio::task::spawn_blocking(move || scanner.check_in())
            .await
            .map_err(|e| ClusterError::Task(e.to_string()))
            .and_then(|r| r);
        match outcome {
            Ok(recovered) => {
                let streak = self.failures.record_success();
                if streak > 0 {
                    info!(failures = streak, "cluster check-in succeeded again");
                }
                recovered
            }
            Err(e) => {
                if self.failures.record_failure() {
                    error!(
                        error = %e,
                        failures = self.failures.consecutive(),
                        "cluster check-in failed"
                    );
                }
                false
            }
        }
    }
}

/// Stops a running [`ClusterManager`].
pub struct ClusterManagerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ClusterManagerHandle {
    /// Cancel the loop and wait for it to exit, including its check-out.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "cluster manager task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{ChannelSignaler, NoopSignaler, SchedulerSignal};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingScanner {
        check_ins: AtomicUsize,
        checked_out: AtomicBool,
        fail: bool,
    }

    impl ClusterScanner for CountingScanner {
        fn check_in(&self) -> Result<bool> {
            self.check_ins.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ClusterError::Task("store down".into()))
            } else {
                Ok(false)
            }
        }

        fn check_out(&self) -> Result<()> {
            self.checked_out.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Reports recovered work on the check-ins numbered in `recovers_on` (1-based).
    struct RecoveringScanner {
        check_ins: AtomicUsize,
        recovers_on: Vec<usize>,
    }

    impl RecoveringScanner {
        fn on(passes: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                check_ins: AtomicUsize::new(0),
                recovers_on: passes.to_vec(),
            })
        }
    }

    impl ClusterScanner for RecoveringScanner {
        fn check_in(&self) -> Result<bool> {
            let n = self.check_ins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.recovers_on.contains(&n))
        }

        fn check_out(&self) -> Result<()> {
            Ok(())
        }
    }

    fn signalling_manager(
        scanner: Arc<RecoveringScanner>,
        interval: Duration,
    ) -> (ClusterManager, tokio::sync::mpsc::Receiver<SchedulerSignal>) {
        let (signaler, rx) = ChannelSignaler::channel(16);
        let manager = ClusterManager::new(
            scanner,
            Arc::new(signaler),
            interval,
            Duration::from_secs(60),
            4,
        );
        (manager, rx)
    }

    fn manager(scanner: Arc<CountingScanner>, interval: Duration) -> ClusterManager {
        ClusterManager::new(
            scanner,
            Arc::new(NoopSignaler),
            interval,
            Duration::from_secs(60),
            4,
        )
    }

    #[tokio::test]
    async fn checks_in_repeatedly_and_checks_out() {
        let scanner = Arc::new(CountingScanner::default());
        let shutdown = CancellationToken::new();
        let handle = manager(Arc::clone(&scanner), Duration::from_millis(20))
            .start(&shutdown)
            .await;
        assert_eq!(scanner.check_ins.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.shutdown().await;
        assert!(scanner.check_ins.load(Ordering::SeqCst) >= 2);
        assert!(scanner.checked_out.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failing_check_in_keeps_loop_alive_and_shutdown_is_prompt() {
        let scanner = Arc::new(CountingScanner {
            fail: true,
            ..Default::default()
        });
        let shutdown = CancellationToken::new();
        let handle = manager(Arc::clone(&scanner), Duration::from_millis(10))
            .start(&shutdown)
            .await;
        // After a failure the next sleep is the 60s retry interval.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        let started = Instant::now();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("loop exits within the sleep's cancellation latency");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(scanner.check_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_on_first_check_in_signals_scheduler() {
        let (manager, mut signals) =
            signalling_manager(RecoveringScanner::on(&[1]), Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        let handle = manager.start(&shutdown).await;
        assert_eq!(signals.try_recv().unwrap(), SchedulerSignal::SchedulingChange(None));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_on_later_pass_signals_scheduler() {
        let scanner = RecoveringScanner::on(&[3]);
        let (manager, mut signals) =
            signalling_manager(Arc::clone(&scanner), Duration::from_millis(20));
        let shutdown = CancellationToken::new();
        let handle = manager.start(&shutdown).await;
        assert!(signals.try_recv().is_err());

        let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("signal after the recovering pass");
        assert_eq!(signal, Some(SchedulerSignal::SchedulingChange(None)));
        assert!(scanner.check_ins.load(Ordering::SeqCst) >= 3);
        handle.shutdown().await;
        assert!(signals.try_recv().is_err());
    }
}
