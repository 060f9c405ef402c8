//! Error types and HTTP response conversion.
//!
//! The [`Error`] enum covers the handler-visible failure cases and converts
//! to HTTP responses with appropriate status codes. Engine errors map onto
//! the public taxonomy: unknown requests are 404, queue saturation is 503
//! with a `Retry-After`, state-machine conflicts are 409, and everything
//! else stays a 500 whose details reach the logs but not the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use stratus::StratusError;
use thiserror::Error as ThisError;

/// Retry-After header value (in seconds) for 503 responses when the queue
/// backend is unavailable.
const QUEUE_UNAVAILABLE_RETRY_AFTER_SECS: &str = "30";

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// A dependency (queue backend) is temporarily unavailable
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Execution engine error
    #[error(transparent)]
    Engine(#[from] StratusError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Engine(engine_err) => match engine_err {
                StratusError::RequestNotFound(_) => StatusCode::NOT_FOUND,
                StratusError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
                StratusError::InvalidTransition { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::ServiceUnavailable { message } => message.clone(),
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Engine(engine_err) => match engine_err {
                StratusError::RequestNotFound(id) => format!("Request {id} not found"),
                StratusError::Queue(_) => {
                    "Request queue temporarily unavailable, please retry".to_string()
                }
                StratusError::InvalidTransition { id, .. } => {
                    format!("Request {id} changed state concurrently")
                }
                _ => "Internal server error".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details; level tracks severity.
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Engine(StratusError::Queue(_)) | Error::ServiceUnavailable { .. } => {
                tracing::warn!("Dependency unavailable: {}", self);
            }
            Error::Engine(engine_err) => match engine_err {
                StratusError::RequestNotFound(_) | StratusError::InvalidTransition { .. } => {
                    tracing::debug!("Client-visible engine error: {}", self);
                }
                _ => {
                    tracing::error!("Engine error: {:#}", self);
                }
            },
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            use axum::http::header::RETRY_AFTER;
            let body = json!({
                "error": "service_unavailable",
                "message": self.user_message(),
                "retry_after_seconds": 30
            });
            return (
                status,
                [(RETRY_AFTER, QUEUE_UNAVAILABLE_RETRY_AFTER_SECS)],
                axum::response::Json(body),
            )
                .into_response();
        }

        (status, self.user_message()).into_response()
    }
}

/// Type alias for handler results
pub type Result<T> = std::result::Result<T, Error>;
