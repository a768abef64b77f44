use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Group used when a key is created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Config value asking the store to generate an instance id at startup.
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// Identity of one scheduler instance within a cluster.
///
/// Stable for the lifetime of the process. Generated ids are UUIDv7 so they
/// sort by start time in the scheduler-state table and in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Resolve a configured id, generating one for `"AUTO"` or an empty value.
    pub fn from_config(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(AUTO_INSTANCE_ID) {
            Self::generate()
        } else {
            Self(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

macro_rules! group_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub name: String,
            pub group: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    group: group.into(),
                }
            }

            /// Key in [`DEFAULT_GROUP`].
            pub fn named(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

group_key!(
    /// Identifies a trigger: unique per scheduler name.
    TriggerKey
);

group_key!(
    /// Identifies a job definition: unique per scheduler name.
    JobKey
);
