use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{ClusterError, Result};
use crate::job_store::RecoverMisfiredJobsResult;
use crate::pacing::{cancellable_sleep, next_misfire_delay, FailureTracker};
use crate::signal::SchedulerSignaler;

/// What the misfire handler needs from the store.
pub trait MisfireScanner: Send + Sync + 'static {
    fn recover_misfires(&self) -> Result<RecoverMisfiredJobsResult>;
}

/// Periodic scan-and-repair of triggers whose fire time passed unnoticed.
pub struct MisfireHandler {
    scanner: Arc<dyn MisfireScanner>,
    signaler: Arc<dyn SchedulerSignaler>,
    threshold: Duration,
    retry_interval: Duration,
    failures: FailureTracker,
}

impl MisfireHandler {
    pub fn new(
        scanner: Arc<dyn MisfireScanner>,
        signaler: Arc<dyn SchedulerSignaler>,
        threshold: Duration,
        retry_interval: Duration,
        failure_log_every: u32,
    ) -> Self {
        Self {
            scanner,
            signaler,
            threshold,
            retry_interval,
            failures: FailureTracker::new(failure_log_every),
        }
    }

    /// Spawn the loop; it runs until `shutdown` or the handle is cancelled.
    pub fn start(self, shutdown: &CancellationToken) -> MisfireHandlerHandle {
        let token = shutdown.child_token();
        let task = tokio::spawn(self.run(token.clone()));
        info!("misfire handler started");
        MisfireHandlerHandle { token, task }
    }

    async fn run(mut self, token: CancellationToken) {
        while !token.is_cancelled() {
            let started = Instant::now();
            let result = self.manage().await;
            if let Some(r) = result.filter(|r| r.processed_count > 0) {
                self.signaler.signal_scheduling_change(r.earliest_new_time);
            }
            let delay = next_misfire_delay(
                self.threshold,
                started.elapsed(),
                result.is_some_and(|r| r.has_more),
                self.failures.consecutive(),
                self.retry_interval,
            );
            if cancellable_sleep(&token, delay).await {
                break;
            }
        }
        info!("misfire handler stopped");
    }

    /// One pass. Failures are counted and logged, never returned.
    async fn manage(&mut self) -> Option<RecoverMisfiredJobsResult> {
        let scanner = Arc::clone(&self.scanner);
        let outcome = tokio::task::spawn_blocking(move || scanner.recover_misfires())
            .await
            .map_err(|e| ClusterError::Task(e.to_string()))
            .and_then(|r| r);
        match outcome {
            Ok(result) => {
                let streak = self.failures.record_success();
                if streak > 0 {
                    info!(failures = streak, "misfire scan succeeded again");
                }
                Some(result)
            }
            Err(e) => {
                if self.failures.record_failure() {
                    error!(
                        error = %e,
                        failures = self.failures.consecutive(),
                        "misfire scan failed"
                    );
                }
                None
            }
        }
    }
}

/// Stops a running [`MisfireHandler`].
pub struct MisfireHandlerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MisfireHandlerHandle {
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "misfire handler task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
