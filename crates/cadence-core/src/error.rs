use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl CoreError {
    /// Short, stable error code for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Invalid { .. } => "INVALID_CONFIG_VALUE",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
