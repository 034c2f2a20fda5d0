//! Well-known event names and per-route event name builders.
//!
//! Control events use fixed names. Route-scoped events are prefixed with the
//! project (scope) id so one server can host many projects.

/// Emitted by the client with its credentials to start verification.
pub const CLIENT_VERIFY_SOCKET: &str = "CLIENT_VERIFY_SOCKET";
/// Sent by the server when verification succeeds.
pub const VERIFICATION_SUCCESS: &str = "CLIENT_SOCKET_VERIFICATION_SUCCESS";
/// Sent by the server when verification is rejected.
pub const VERIFICATION_ERROR: &str = "CLIENT_SOCKET_VERIFICATION_ERROR";
/// Sent by the server to ask the client to reconnect (session rotation).
pub const RECONNECTION_TRIGGER: &str = "CLIENT_SOCKET_RECONNECTION_TRIGGER";

/// Route id of the built-in server time stream.
pub const SERVER_TIME_ROUTE: &str = "UTILITIES_SERVER_TIME";
/// Fixed stream key of the built-in server time stream.
pub const SERVER_TIME_KEY: &str = "UTILITIES_SERVER_TIME_RESULT";

/// Route validation request for read routes.
pub const VALIDATE_SYNC: &str = "UTILITIES_VALIDATE_SYNC";
/// Route validation request for write routes.
pub const VALIDATE_WRITE: &str = "UTILITIES_VALIDATE_WRITE";

/// Suffix appended to a response id for its error channel.
pub const ERROR_SUFFIX: &str = "_ERROR";

/// Event on which subscribe requests for `route_id` are emitted.
pub fn read_event(project_id: &str, route_id: &str) -> String {
    format!("{project_id}_{route_id}_read")
}

/// Event on which write requests for `route_id` are emitted.
pub fn write_event(project_id: &str, route_id: &str) -> String {
    format!("{project_id}_{route_id}_write")
}

/// Project-scoped name of a utility event.
pub fn utility_event(project_id: &str, utility: &str) -> String {
    format!("{project_id}_{utility}")
}

/// Error channel for a response id or stream key.
pub fn error_event(response_id: &str) -> String {
    format!("{response_id}{ERROR_SUFFIX}")
}

/// Error channel on which read route validation failures arrive.
pub fn validate_sync_error_event() -> String {
    error_event(VALIDATE_SYNC)
}

/// Strips the error suffix, returning the response id it belongs to.
pub fn strip_error_suffix(event: &str) -> Option<&str> {
    event.strip_suffix(ERROR_SUFFIX)
}
