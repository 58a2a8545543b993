//! Error types for linkage operations.

use std::time::Duration;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by the public linkage operations.
#[derive(Debug, Error)]
pub enum LinkageError {
    /// Invalid settings or call arguments - fatal, raised before any data is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// Training produced no usable data (e.g. a blocking rule that generates no pairs).
    #[error("{0}")]
    EmTraining(String),

    /// Execution backend failure.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend phase exceeded the configured caller-level timeout.
    #[error("phase `{phase}` timed out after {after:?}")]
    Timeout { phase: String, after: Duration },

    /// A single-use session was driven out of order.
    #[error("session state error: {0}")]
    SessionState(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkageError>;

impl LinkageError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an EM training (data) error.
    pub fn em_training(message: impl Into<String>) -> Self {
        Self::EmTraining(message.into())
    }

    /// Create a session state error.
    pub fn session_state(message: impl Into<String>) -> Self {
        Self::SessionState(message.into())
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::EmTraining(_) => "em_training_error",
            Self::Backend(_) => "backend_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout { .. } => "timeout",
            Self::SessionState(_) => "session_state_error",
        }
    }

    /// Whether this error is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
