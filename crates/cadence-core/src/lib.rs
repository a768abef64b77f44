//! `cadence-core`: configuration and identity types shared by every cadence crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CoreError, Result};
pub use types::{InstanceId, JobKey, TriggerKey};
