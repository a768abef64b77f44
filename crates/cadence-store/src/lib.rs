//! `cadence-store`: SQLite persistence for the cadence coordination engine.
//!
//! # Overview
//!
//! One database file holds the coordination tables of any number of logical
//! schedulers, each table keyed by scheduler name first:
//!
//! | Table             | Contents                                            |
//! |-------------------|-----------------------------------------------------|
//! | `locks`           | One payload-free row per named lock                 |
//! | `scheduler_state` | Heartbeat of every live or recently live instance   |
//! | `job_details`     | Job definitions and their concurrency flags         |
//! | `triggers`        | Trigger definitions plus state and fire times       |
//! | `fired_triggers`  | One row per in-flight firing anywhere in the cluster |
//!
//! [`delegate::StoreDelegate`] exposes typed operations on these tables. All
//! state transitions are compare-and-set updates that report affected rows.

pub mod db;
pub mod delegate;
pub mod error;
pub mod pool;
pub mod schedule;
pub mod types;

pub use db::{init_db, provision_locks, Tables, LOCK_NAMES};
pub use delegate::StoreDelegate;
pub use error::{is_busy, Result, StoreError};
pub use pool::{ConnectionPool, PooledConnection};
pub use schedule::Schedule;
pub use types::{
    FiredTriggerRecord, JobRecord, MisfireOutcome, MisfirePolicy, SchedulerStateRecord,
    TriggerRecord, TriggerState, RECOVERY_GROUP,
};
