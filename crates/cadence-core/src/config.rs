use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::AUTO_INSTANCE_ID;

pub const DEFAULT_TABLE_PREFIX: &str = "cadence_";
pub const DEFAULT_SCHEDULER_NAME: &str = "cadence";
pub const DEFAULT_CHECKIN_INTERVAL_MS: u64 = 7_500;
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 60_000;
pub const DEFAULT_DB_RETRY_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_MISFIRES_PER_PASS: usize = 20;
pub const DEFAULT_FAILURE_LOG_EVERY: u32 = 4;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub misfire: MisfireConfig,
    #[serde(default)]
    pub locking: LockingConfig,
}

/// How Locked Execution treats transaction boundaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TxMode {
    /// Locked Execution begins, commits and rolls back its own transaction.
    #[default]
    NonManaged,
    /// The host owns the transaction; only locks are taken and released.
    Managed,
}

/// Which database locking statement guards a lock row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LockStrategyKind {
    /// Row-locking select inside a write-reserving transaction.
    #[default]
    RowSelect,
    /// No-op update of the lock row; the write itself conflicts.
    RowUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    /// `"AUTO"` generates a fresh id on every start.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default)]
    pub clustered: bool,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Upper bound on open connections per store.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Create tables and lock rows on open.
    #[serde(default = "bool_true")]
    pub provision_schema: bool,
    #[serde(default)]
    pub tx_mode: TxMode,
    /// Take TRIGGER_ACCESS even when acquiring a single trigger.
    #[serde(default)]
    pub acquire_triggers_within_lock: bool,
    #[serde(default = "default_db_retry_interval_ms")]
    pub db_retry_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            table_prefix: default_table_prefix(),
            scheduler_name: default_scheduler_name(),
            instance_id: default_instance_id(),
            clustered: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            max_connections: default_max_connections(),
            provision_schema: true,
            tx_mode: TxMode::default(),
            acquire_triggers_within_lock: false,
            db_retry_interval_ms: default_db_retry_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn db_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_retry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_checkin_interval_ms")]
    pub checkin_interval_ms: u64,
    /// An instance is dead once `now - last_checkin > interval * tolerance_factor`.
    #[serde(default = "default_tolerance_factor")]
    pub tolerance_factor: f64,
    /// Log the first loop failure and then every Nth consecutive one.
    #[serde(default = "default_failure_log_every")]
    pub failure_log_every: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            checkin_interval_ms: default_checkin_interval_ms(),
            tolerance_factor: default_tolerance_factor(),
            failure_log_every: default_failure_log_every(),
        }
    }
}

impl ClusterConfig {
    pub fn checkin_interval(&self) -> Duration {
        Duration::from_millis(self.checkin_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisfireConfig {
    #[serde(default = "default_misfire_threshold_ms")]
    pub threshold_ms: u64,
    #[serde(default = "default_max_per_pass")]
    pub max_per_pass: usize,
    /// Count overdue triggers without a lock before taking TRIGGER_ACCESS.
    #[serde(default = "bool_true")]
    pub double_check_lock: bool,
}

impl Default for MisfireConfig {
    fn default() -> Self {
        Self {
            threshold_ms: default_misfire_threshold_ms(),
            max_per_pass: default_max_per_pass(),
            double_check_lock: true,
        }
    }
}

impl MisfireConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingConfig {
    /// `None`: database locks iff clustered. `Some(false)` is ignored when clustered.
    #[serde(default)]
    pub use_db_locks: Option<bool>,
    #[serde(default)]
    pub strategy: LockStrategyKind,
    /// Replacement for the row-select statement. `{prefix}` expands to the
    /// table prefix, `?1` binds the scheduler name and `?2` the lock name.
    #[serde(default)]
    pub select_with_lock_sql: Option<String>,
    #[serde(default = "default_lock_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_lock_retry_period_ms")]
    pub retry_period_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            use_db_locks: None,
            strategy: LockStrategyKind::default(),
            select_with_lock_sql: None,
            retry_count: default_lock_retry_count(),
            retry_period_ms: default_lock_retry_period_ms(),
        }
    }
}

impl LockingConfig {
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    /// Whether database row locks guard this store.
    pub fn db_locks_enabled(&self, clustered: bool) -> bool {
        match self.use_db_locks {
            Some(true) => true,
            Some(false) if clustered => {
                tracing::warn!("use_db_locks=false ignored: clustered stores always use database locks");
                true
            }
            Some(false) => false,
            None => clustered,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_table_prefix() -> String {
    DEFAULT_TABLE_PREFIX.to_string()
}
fn default_scheduler_name() -> String {
    DEFAULT_SCHEDULER_NAME.to_string()
}
fn default_instance_id() -> String {
    AUTO_INSTANCE_ID.to_string()
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_max_connections() -> u32 {
    8
}
fn default_db_retry_interval_ms() -> u64 {
    DEFAULT_DB_RETRY_INTERVAL_MS
}
fn default_checkin_interval_ms() -> u64 {
    DEFAULT_CHECKIN_INTERVAL_MS
}
fn default_tolerance_factor() -> f64 {
    2.0
}
fn default_failure_log_every() -> u32 {
    DEFAULT_FAILURE_LOG_EVERY
}
fn default_misfire_threshold_ms() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_MS
}
fn default_max_per_pass() -> usize {
    DEFAULT_MAX_MISFIRES_PER_PASS
}
fn default_lock_retry_count() -> u32 {
    3
}
fn default_lock_retry_period_ms() -> u64 {
    1_000
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys use a double underscore: `CADENCE_STORE__CLUSTERED=true`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::from(Serialized::defaults(CadenceConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__")),
        )
    }

    /// Extract and validate a config from an already layered figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: CadenceConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = &self.store.table_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CoreError::Invalid {
                field: "store.table_prefix",
                reason: format!("{prefix:?} must be non-empty and contain only [A-Za-z0-9_]"),
            });
        }
        if self.store.scheduler_name.trim().is_empty() {
            return Err(CoreError::Invalid {
                field: "store.scheduler_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cluster.checkin_interval_ms == 0 {
            return Err(CoreError::Invalid {
                field: "cluster.checkin_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.cluster.tolerance_factor.is_nan() || self.cluster.tolerance_factor < 1.0 {
            return Err(CoreError::Invalid {
                field: "cluster.tolerance_factor",
                reason: format!("{} is below 1.0", self.cluster.tolerance_factor),
            });
        }
        if self.cluster.failure_log_every == 0 {
            return Err(CoreError::Invalid {
                field: "cluster.failure_log_every",
                reason: "must be positive".to_string(),
            });
        }
        if self.misfire.threshold_ms == 0 {
            return Err(CoreError::Invalid {
                field: "misfire.threshold_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.misfire.max_per_pass == 0 {
            return Err(CoreError::Invalid {
                field: "misfire.max_per_pass",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
