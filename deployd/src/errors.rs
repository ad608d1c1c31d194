//! Error types for the deploy service

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why fetching source code into a workspace failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Repository or branch does not exist
    NotFound,

    /// The remote asked for credentials
    AuthRequired,

    /// DNS, connection or transfer failure
    Network,

    /// Anything git reported that we could not classify
    Other(String),
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::NotFound => write!(f, "repository or branch not found"),
            FetchFailure::AuthRequired => write!(f, "authentication required"),
            FetchFailure::Network => write!(f, "network failure"),
            FetchFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Main error type for the deploy service
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Workspace error: {0}")]
    WorkspaceError(String),

    #[error("Fetch error: {0}")]
    FetchError(FetchFailure),

    #[error("{stage} exceeded its time limit of {}s", limit.as_secs())]
    TimeoutError { stage: String, limit: Duration },

    #[error("{stage} command exited with {}", code.map(|c| format!("code {c}")).unwrap_or_else(|| "a signal".to_string()))]
    CommandFailed { stage: String, code: Option<i32> },

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Deployment cancelled")]
    CancelledError,

    #[error("Process exited unexpectedly{}", code.map(|c| format!(" with code {c}")).unwrap_or_default())]
    ProcessExited { code: Option<i32> },

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Cancellation is a user action, not a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::CancelledError)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
