//! Validation errors for protocol records.

use thiserror::Error;

/// Result type for protocol validation.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised when a decoded record violates the protocol's shape rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A server-originated message id fell outside the server id range.
    #[error("message id {0} is outside the server id range")]
    InvalidServerId(i64),

    /// A pts/qts counter update declared a non-positive count.
    #[error("invalid {counter} count {count}")]
    InvalidCount {
        /// Counter name.
        counter: &'static str,
        /// Declared count.
        count: i32,
    },

    /// A combined batch declared `seq_start` after `seq`.
    #[error("combined batch seq_start {seq_start} is after seq {seq}")]
    SeqRange {
        /// First sequence number covered by the batch.
        seq_start: i32,
        /// Last sequence number covered by the batch.
        seq: i32,
    },
}
