use cadence_core::TriggerKey;
use cadence_store::TriggerRecord;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

/// Callbacks into the scheduler's main fire loop.
pub trait SchedulerSignaler: Send + Sync {
    /// Something changed that may make a trigger due sooner; re-evaluate the
    /// wait, no later than `candidate_new_next_fire_time` if one is given.
    fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>);

    fn notify_trigger_misfired(&self, _trigger: &TriggerRecord) {}

    /// The trigger will never fire again.
    fn notify_trigger_finalized(&self, _trigger: &TriggerKey) {}
}

/// Signaler for stores that run without a fire loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
    fn signal_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {}
}

/// A notification forwarded by [`ChannelSignaler`].
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerSignal {
    SchedulingChange(Option<DateTime<Utc>>),
    TriggerMisfired(TriggerKey),
    TriggerFinalized(TriggerKey),
}

/// Forwards signals over an mpsc channel without ever blocking the sender.
///
/// A full or closed channel drops the signal with a warning; the fire loop
/// re-evaluates on its own schedule anyway.
#[derive(Debug, Clone)]
pub struct ChannelSignaler {
    tx: mpsc::Sender<SchedulerSignal>,
}

impl ChannelSignaler {
    pub fn new(tx: mpsc::Sender<SchedulerSignal>) -> Self {
        Self { tx }
    }

    /// A signaler plus the receiving end of a channel of `capacity`.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SchedulerSignal>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn forward(&self, signal: SchedulerSignal) {
        if let Err(e) = self.tx.try_send(signal) {
            warn!(signal = ?e.into_inner(), "scheduler signal channel full or closed; signal dropped");
        }
    }
}

impl SchedulerSignaler for ChannelSignaler {
    fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        self.forward(SchedulerSignal::SchedulingChange(candidate_new_next_fire_time));
    }

    fn notify_trigger_misfired(&self, trigger: &TriggerRecord) {
        self.forward(SchedulerSignal::TriggerMisfired(trigger.key.clone()));
    }

    fn notify_trigger_finalized(&self, trigger: &TriggerKey) {
        self.forward(SchedulerSignal::TriggerFinalized(trigger.clone()));
    }
}
