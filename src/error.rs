use thiserror::Error;

/// Errors surfaced by the vetting pipeline.
///
/// Signal-level problems are recovered where they happen and only show up here
/// when a caller asks a probe directly. Policy and action problems are meant for
/// human operators.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Signal unavailable ({probe}): {message}")]
    SignalUnavailable { probe: String, message: String },
    #[error("Invalid configuration for community {community}: {message}")]
    ConfigInvalid { community: String, message: String },
    #[error("Platform action failed: {0}")]
    ActionExecutionFailed(String),
    #[error("Case {0} was already resolved by another path")]
    TimerRaceLost(String),
    #[error("Unknown case: {0}")]
    UnknownCase(String),
    #[error("Invalid admin command: {0}")]
    InvalidCommand(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl WardenError {
    pub fn config_invalid(community: &str, message: impl Into<String>) -> Self {
        WardenError::ConfigInvalid {
            community: community.to_string(),
            message: message.into(),
        }
    }

    pub fn signal_unavailable(probe: &str, message: impl Into<String>) -> Self {
        WardenError::SignalUnavailable {
            probe: probe.to_string(),
            message: message.into(),
        }
    }

    /// Informational errors are logged at debug level and never alert anyone.
    pub fn is_informational(&self) -> bool {
        matches!(self, WardenError::TimerRaceLost(_))
    }
}

impl From<std::io::Error> for WardenError {
    fn from(e: std::io::Error) -> Self {
        WardenError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
