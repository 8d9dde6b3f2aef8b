//! Error types for the sync engine.

use chatsync_protocol::{ProtocolError, RequestToken};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed record from the server.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server revoked the session.
    #[error("session revoked")]
    SessionRevoked,

    /// Server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// A completion arrived for a request that is no longer outstanding.
    #[error("stale completion for {token}")]
    StaleCompletion {
        /// Token of the superseded request.
        token: RequestToken,
    },

    /// An id remap or send result named a correlation token nobody tracks.
    #[error("unknown correlation token {0}")]
    UnknownCorrelationToken(String),

    /// A correlation token was registered twice.
    #[error("duplicate correlation token {0}")]
    DuplicateCorrelationToken(String),

    /// A window operation named a window that does not exist.
    #[error("unknown window {0}")]
    UnknownWindow(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::NotConnected => true,
            SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true if the session can no longer be used and the user must
    /// re-authenticate.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationFailed(_) | SyncError::SessionRevoked
        )
    }
}
