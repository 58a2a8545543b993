//! Error types for the execution backend.

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("backend lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("table not found: {0}")]
    MissingTable(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
