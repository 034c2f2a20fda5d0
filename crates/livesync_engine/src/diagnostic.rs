//! Out-of-band events reported by the engine.

use serde_json::Value;

/// Something the engine observed that no single caller is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The transport dropped while verified.
    ConnectionLost {
        /// Reason reported by the transport.
        reason: String,
    },
    /// The connection was re-verified and every stream replayed.
    Reconnected,
    /// Reconnection gave up; streams keep their last value.
    ReconnectFailed {
        /// Final error.
        error: String,
    },
    /// The server sent an error on a stream's error channel.
    StreamError {
        /// Stream key.
        key: String,
        /// Error payload.
        error: Value,
    },
    /// An operation event could not be merged.
    RejectedOperation {
        /// Stream key.
        key: String,
        /// Why the event was rejected.
        error: String,
    },
    /// The server rejected a route during validation.
    RouteRejected {
        /// Error payload.
        error: Value,
    },
}
