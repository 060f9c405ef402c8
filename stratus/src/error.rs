use thiserror::Error;

use crate::request::{RequestId, RequestStatus};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StratusError>;

/// Errors that can occur in the execution engine.
#[derive(Debug, Error)]
pub enum StratusError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// A status change violated the request state machine
    #[error("Invalid status transition for request {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Queue backend operation failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem or process I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<fred::error::Error> for StratusError {
    fn from(err: fred::error::Error) -> Self {
        StratusError::Queue(err.to_string())
    }
}
