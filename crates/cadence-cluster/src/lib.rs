//! `cadence-cluster`: the coordination engine of a clustered scheduler.
//!
//! Several scheduler instances share one `cadence-store` database. This crate
//! keeps them from stepping on each other:
//!
//! - [`semaphore`] provides named store-wide locks, backed by lock rows in
//!   the database or by an in-process table when only one instance runs.
//! - [`locked`] runs a unit of work inside one transaction with a named lock
//!   held, in the store's own transaction or one the host manages.
//! - [`job_store`] is the trigger state machine. Every transition is a
//!   compare-and-set update, so a lost race shows up as zero affected rows.
//! - [`cluster`] heartbeats this instance and recovers the work of dead ones.
//! - [`misfire`] repairs triggers whose fire time passed unnoticed.
//!
//! The two background loops run on tokio and push their blocking database
//! work onto `spawn_blocking`; everything below them is synchronous.

pub mod cluster;
pub mod error;
pub mod job_store;
pub mod locked;
pub mod misfire;
pub mod pacing;
pub mod semaphore;
pub mod signal;

pub use cluster::{ClusterManager, ClusterManagerHandle, ClusterScanner};
pub use error::{ClusterError, Result};
pub use job_store::{
    AcquiredTrigger, CompletedExecutionInstruction, FiredBundle, FiredOutcome, HostTransaction,
    JobStore, RecoverMisfiredJobsResult, SkipReason, TriggerStore,
};
pub use locked::{LockedExecution, LockedExecutor, LockedTx};
pub use misfire::{MisfireHandler, MisfireHandlerHandle, MisfireScanner};
pub use semaphore::{LockHandle, LockName, LockStrategy, Semaphore};
pub use signal::{ChannelSignaler, NoopSignaler, SchedulerSignal, SchedulerSignaler};
