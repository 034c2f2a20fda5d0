//! Stream key fingerprints and id generation.

use serde_json::{json, Value};

/// Derives the stream key for a request.
///
/// The key is `"<scope>_<route>_<kind>_"`, followed by the JSON encoding of
/// `{"data": body}` when a body is present. Object keys are emitted in
/// sorted order, so equal bodies always produce equal keys regardless of how
/// they were built.
pub fn fingerprint(scope_id: &str, route_id: &str, kind: &str, body: &Value) -> String {
    let mut key = format!("{scope_id}_{route_id}_{kind}_");
    if !body.is_null() {
        key.push_str(&json!({ "data": body }).to_string());
    }
    key
}

/// Source of collision-resistant identifiers for observers and calls.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh identifier.
    fn next_id(&self) -> String;
}

/// Generates random UUID v4 identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
