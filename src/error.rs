//! Error taxonomy shared by the core runtime components.
//!
//! Core components return these typed errors; the transport layer maps them
//! to HTTP status codes. Errors raised on background tasks (pipe readers,
//! scanner ticks, watch loops) are logged and never terminate the runtime.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Process, upload, part, file or directory does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Malformed request input (bad permissions string, part number out of
    /// range, missing field, name already taken by a running process, ...).
    #[error("{0}")]
    InvalidInput(String),

    /// A relative path resolved outside of the working root.
    #[error("path is outside of the root directory")]
    PathEscape,

    /// ETag mismatch or a missing part at upload completion.
    #[error("{0}")]
    Conflict(String),

    /// An external collaborator is not configured.
    #[error("{0}")]
    Unavailable(String),

    /// Host filesystem or process-creation failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A wait-for-completion deadline expired; the child keeps running.
    #[error("{0}")]
    Timeout(String),
}

impl AgentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::InvalidInput(_) | AgentError::PathEscape => StatusCode::BAD_REQUEST,
            AgentError::Conflict(_) | AgentError::Io(_) | AgentError::Timeout(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AgentError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_transport_contract() {
        assert_eq!(
            AgentError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AgentError::PathEscape.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AgentError::Conflict("etag mismatch for part 2".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AgentError::Timeout("process timed out after 5 seconds".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
