use thiserror::Error;

/// Errors raised by the sync engine, the platform client and the
/// subscription operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recovery failed after {attempts} attempts: {message}")]
    RecoveryFailed { attempts: u32, message: String },
}

impl SyncError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<lapin::Error> for SyncError {
    fn from(e: lapin::Error) -> Self {
        SyncError::Queue(e.to_string())
    }
}
