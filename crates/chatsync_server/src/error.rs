//! Error types for the reference server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the reference server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The client's session was revoked.
    #[error("session revoked")]
    SessionRevoked,

    /// Malformed or disallowed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A referenced user, chat or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::SessionRevoked | ServerError::InvalidRequest(_) | ServerError::NotFound(_)
        )
    }

    /// Returns true if the server was at fault.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }
}
