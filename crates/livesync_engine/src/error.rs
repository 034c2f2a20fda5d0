//! Error types for the sync engine.

use livesync_protocol::ProtocolError;
use serde_json::Value;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The server rejected verification.
    #[error("verification rejected: {0}")]
    Handshake(Value),

    /// The server returned an error payload for a call.
    #[error("remote error: {0}")]
    Remote(Value),

    /// An operation kind the merge step does not understand arrived for a
    /// list-shaped stream.
    #[error("operation code {code} is not supported (stream {key})")]
    UnsupportedOperation {
        /// Stream key.
        key: String,
        /// Raw operation code.
        code: u8,
    },

    /// A stream was created for a key that already has one.
    #[error("stream already exists: {0}")]
    DuplicateStream(String),

    /// An incremental event did not match the stream's current document.
    #[error("stale event for stream {key}")]
    StaleEvent {
        /// Stream key.
        key: String,
    },

    /// No stream exists for the key.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Wire message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON value could not be converted to or from the caller's type.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid connection state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The engine task has stopped.
    #[error("sync engine closed")]
    Closed,
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
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}
