// The trigger lifecycle through the store façade, plus misfire repair.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cadence_cluster::{
    ChannelSignaler, CompletedExecutionInstruction, FiredOutcome, JobStore, MisfireHandler,
    MisfireScanner, NoopSignaler, RecoverMisfiredJobsResult, SchedulerSignal, SkipReason,
    TriggerStore,
};
use cadence_core::{CadenceConfig, JobKey, TriggerKey};
use cadence_store::{JobRecord, MisfirePolicy, Schedule, TriggerRecord, TriggerState};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

fn config(dir: &tempfile::TempDir) -> CadenceConfig {
    config_for(dir, "node-a")
}

fn config_for(dir: &tempfile::TempDir, instance: &str) -> CadenceConfig {
    let mut config = CadenceConfig::default();
    config.store.path = dir.path().join("cadence.db").to_string_lossy().into_owned();
    config.store.instance_id = instance.to_string();
    config.store.clustered = true;
    config
}

fn open(dir: &tempfile::TempDir) -> JobStore {
    JobStore::open(config(dir), Arc::new(NoopSignaler)).unwrap()
}

fn once(name: &str, job: &JobKey, at: chrono::DateTime<Utc>) -> TriggerRecord {
    TriggerRecord::new(TriggerKey::named(name), job.clone(), Schedule::Once, at)
}

fn hourly_since(name: &str, job: &JobKey, hours_ago: i64) -> TriggerRecord {
    TriggerRecord::new(
        TriggerKey::named(name),
        job.clone(),
        Schedule::Interval {
            every_ms: 3_600_000,
            repeat_count: None,
        },
        Utc::now() - chrono::Duration::hours(hours_ago),
    )
}

#[test]
fn acquire_fire_complete() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    let trigger = once("now", &job.key, Utc::now() - chrono::Duration::seconds(1));
    store.store_trigger(&trigger, false).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(store.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Acquired));

    let outcomes = store.triggers_fired(&acquired).unwrap();
    let FiredOutcome::Fired(bundle) = &outcomes[0] else {
        panic!("expected a firing, got {outcomes:?}");
    };
    assert_eq!(bundle.job.key, job.key);
    assert_eq!(bundle.trigger.next_fire_time, None);
    assert_eq!(store.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Executing));

    store
        .triggered_job_complete(bundle, CompletedExecutionInstruction::Noop)
        .unwrap();
    assert_eq!(store.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Complete));
    assert!(store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap()
        .is_empty());
}

#[test]
fn concurrent_acquire_across_instances_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let a = JobStore::open(config_for(&dir, "node-a"), Arc::new(NoopSignaler)).unwrap();
    let b = JobStore::open(config_for(&dir, "node-b"), Arc::new(NoopSignaler)).unwrap();
    let job = JobRecord::new(JobKey::named("report"));
    a.store_job(&job, false).unwrap();

    for round in 0..20 {
        let at = Utc::now() - chrono::Duration::seconds(1);
        let trigger = once(&format!("race-{round}"), &job.key, at);
        a.store_trigger(&trigger, false).unwrap();

        let barrier = Barrier::new(2);
        let race = |store: &JobStore| {
            barrier.wait();
            store.acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        };
        let (won_a, won_b) = thread::scope(|s| {
            let ha = s.spawn(|| race(&a));
            let hb = s.spawn(|| race(&b));
            (ha.join().unwrap(), hb.join().unwrap())
        });
        // The loser sees nothing to do, never an error.
        let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());
        assert_eq!(won_a.len() + won_b.len(), 1, "round {round}");
        assert_eq!(a.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Acquired));
    }
}

#[test]
fn trigger_paused_while_executing_completes_when_finished() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report")).durable();
    store.store_job(&job, false).unwrap();
    let one_shot = once("last", &job.key, Utc::now() - chrono::Duration::seconds(1));
    store.store_trigger(&one_shot, false).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    let outcomes = store.triggers_fired(&acquired).unwrap();
    let FiredOutcome::Fired(bundle) = &outcomes[0] else {
        panic!("expected a firing, got {outcomes:?}");
    };
    assert!(store.pause_trigger(&one_shot.key).unwrap());
    assert_eq!(
        store.trigger_state(&one_shot.key).unwrap(),
        Some(TriggerState::PausedBlocked)
    );

    store
        .triggered_job_complete(bundle, CompletedExecutionInstruction::Noop)
        .unwrap();
    assert_eq!(store.trigger_state(&one_shot.key).unwrap(), Some(TriggerState::Complete));
}

#[test]
fn repeating_trigger_paused_while_executing_stays_paused() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    let hourly = TriggerRecord::new(
        TriggerKey::named("hourly"),
        job.key.clone(),
        Schedule::Interval {
            every_ms: 3_600_000,
            repeat_count: None,
        },
        Utc::now() - chrono::Duration::seconds(1),
    );
    store.store_trigger(&hourly, false).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    let outcomes = store.triggers_fired(&acquired).unwrap();
    let FiredOutcome::Fired(bundle) = &outcomes[0] else {
        panic!("expected a firing, got {outcomes:?}");
    };
    assert!(store.pause_trigger(&hourly.key).unwrap());

    store
        .triggered_job_complete(bundle, CompletedExecutionInstruction::Noop)
        .unwrap();
    assert_eq!(store.trigger_state(&hourly.key).unwrap(), Some(TriggerState::Paused));
}

#[test]
fn duplicate_store_without_replace_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    let err = store.store_job(&job, false).unwrap_err();
    assert_eq!(err.code(), "STORE_ERROR");
    store.store_job(&job, true).unwrap();
}

#[test]
fn trigger_without_job_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let trigger = once("orphan", &JobKey::named("missing"), Utc::now());
    assert!(store.store_trigger(&trigger, false).is_err());
    assert!(store.retrieve_trigger(&trigger.key).unwrap().is_none());
}

#[test]
fn non_concurrent_job_blocks_its_other_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("ledger")).non_concurrent();
    store.store_job(&job, false).unwrap();
    let now = Utc::now() - chrono::Duration::seconds(1);
    let first = once("first", &job.key, now);
    let second = once("second", &job.key, now);
    store.store_trigger(&first, false).unwrap();
    store.store_trigger(&second, false).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 2, chrono::Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1, "one trigger per non-concurrent job");
    let fired_key = acquired[0].trigger.key.clone();
    let other_key = if fired_key == first.key { &second.key } else { &first.key };

    let outcomes = store.triggers_fired(&acquired).unwrap();
    let FiredOutcome::Fired(bundle) = &outcomes[0] else {
        panic!("expected a firing");
    };
    assert_eq!(store.trigger_state(other_key).unwrap(), Some(TriggerState::Blocked));

    store
        .triggered_job_complete(bundle, CompletedExecutionInstruction::DeleteTrigger)
        .unwrap();
    assert_eq!(store.trigger_state(other_key).unwrap(), Some(TriggerState::Waiting));
    assert!(store.retrieve_trigger(&fired_key).unwrap().is_none());
}

#[test]
fn paused_after_acquire_loses_the_race() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report")).durable();
    store.store_job(&job, false).unwrap();
    let trigger = once("now", &job.key, Utc::now() - chrono::Duration::seconds(1));
    store.store_trigger(&trigger, false).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    assert!(store.pause_trigger(&trigger.key).unwrap());

    let outcomes = store.triggers_fired(&acquired).unwrap();
    assert_eq!(
        outcomes,
        vec![FiredOutcome::Skipped {
            trigger: trigger.key.clone(),
            reason: SkipReason::LostRace,
        }]
    );
    assert_eq!(store.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Paused));

    assert!(store.resume_trigger(&trigger.key).unwrap());
    assert_eq!(store.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Waiting));
}

#[test]
fn released_trigger_can_be_acquired_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    store
        .store_trigger(&once("now", &job.key, Utc::now()), false)
        .unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    store.release_acquired_trigger(&acquired[0]).unwrap();
    let again = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_ne!(again[0].entry_id, acquired[0].entry_id);
}

#[test]
fn misfired_trigger_fires_now() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    let trigger = hourly_since("late", &job.key, 2).with_misfire_policy(MisfirePolicy::FireNow);
    store.store_trigger(&trigger, false).unwrap();

    let before = Utc::now();
    let result = store.recover_misfires().unwrap();
    assert_eq!(result.processed_count, 1);
    assert!(!result.has_more);

    let repaired = store.retrieve_trigger(&trigger.key).unwrap().unwrap();
    let next = repaired.next_fire_time.unwrap();
    assert!(next >= before && next <= Utc::now());
    assert_eq!(result.earliest_new_time, Some(next));
    assert_eq!(repaired.state, TriggerState::Waiting);

    // Repaired triggers are no longer overdue.
    assert_eq!(store.recover_misfires().unwrap(), RecoverMisfiredJobsResult::NO_OP);
}

#[test]
fn misfired_one_shot_with_skip_completes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report")).durable();
    store.store_job(&job, false).unwrap();
    let trigger = once("gone", &job.key, Utc::now() - chrono::Duration::hours(1))
        .with_misfire_policy(MisfirePolicy::SkipToNext);
    store.store_trigger(&trigger, false).unwrap();

    let result = store.recover_misfires().unwrap();
    assert_eq!(result.processed_count, 1);
    assert_eq!(result.earliest_new_time, None);
    assert_eq!(store.trigger_state(&trigger.key).unwrap(), Some(TriggerState::Complete));
}

#[test]
fn ignore_misfires_is_never_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir);
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    let trigger = hourly_since("lax", &job.key, 3)
        .with_misfire_policy(MisfirePolicy::IgnoreMisfires);
    store.store_trigger(&trigger, false).unwrap();

    assert_eq!(store.recover_misfires().unwrap(), RecoverMisfiredJobsResult::NO_OP);
    // Still acquirable despite being hours late.
    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, chrono::Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1);
}

#[test]
fn misfire_pass_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.misfire.max_per_pass = 2;
    let store = JobStore::open(config, Arc::new(NoopSignaler)).unwrap();
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    for i in 0..3 {
        store
            .store_trigger(&hourly_since(&format!("late-{i}"), &job.key, 2), false)
            .unwrap();
    }

    let first = store.recover_misfires().unwrap();
    assert_eq!(first.processed_count, 2);
    assert!(first.has_more);
    let second = store.recover_misfires().unwrap();
    assert_eq!(second.processed_count, 1);
    assert!(!second.has_more);
}

#[tokio::test]
async fn misfire_handler_signals_repairs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(&dir));
    let job = JobRecord::new(JobKey::named("report"));
    store.store_job(&job, false).unwrap();
    store
        .store_trigger(&hourly_since("late", &job.key, 2), false)
        .unwrap();

    let (signaler, mut rx) = ChannelSignaler::channel(8);
    let shutdown = CancellationToken::new();
    let handle = MisfireHandler::new(
        Arc::clone(&store) as Arc<dyn MisfireScanner>,
        Arc::new(signaler),
        Duration::from_secs(60),
        Duration::from_secs(15),
        4,
    )
    .start(&shutdown);

    let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(signal, SchedulerSignal::SchedulingChange(Some(_))));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .unwrap();
}
