//! Wire messages exchanged with the realtime server.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{OperationKind, StreamKind};

fn encode<T: Serialize>(message: &T) -> ProtocolResult<Value> {
    serde_json::to_value(message).map_err(|e| ProtocolError::invalid_structure(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> ProtocolResult<T> {
    serde_json::from_value(value).map_err(|e| ProtocolError::invalid_structure(e.to_string()))
}

/// Verification request carrying the client's credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Project the client belongs to.
    pub project_id: String,
}

impl VerifyRequest {
    /// Creates a verification request.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }
}

/// Request registering a stream subscription with the server.
///
/// The server replies on the event named by `response_id`, which is also the
/// local stream key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Query body sent to the route.
    pub body: Value,
    /// Stream key; the event name replies arrive on.
    pub response_id: String,
    /// Route being subscribed to.
    pub route_id: String,
    /// Stream kind tag.
    pub sync_type: StreamKind,
}

impl SubscribeRequest {
    /// Creates a subscribe request. A null body is sent as an empty object.
    pub fn new(
        response_id: impl Into<String>,
        route_id: impl Into<String>,
        sync_type: StreamKind,
        body: Value,
    ) -> Self {
        let body = if body.is_null() {
            Value::Object(Default::default())
        } else {
            body
        };
        Self {
            body,
            response_id: response_id.into(),
            route_id: route_id.into(),
            sync_type,
        }
    }

    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }
}

/// Inbound stream update.
///
/// Without `op_type` the result replaces the stream value wholesale (the
/// initial snapshot). With `op_type` it is an incremental change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    /// New document, list, or changed document.
    pub result: Value,
    /// Server timestamp of the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Kind of incremental change, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_type: Option<OperationKind>,
}

impl OperationEvent {
    /// Creates a wholesale snapshot event.
    pub fn snapshot(result: Value) -> Self {
        Self {
            result,
            timestamp: None,
            op_type: None,
        }
    }

    /// Creates an incremental change event.
    pub fn change(op_type: OperationKind, result: Value) -> Self {
        Self {
            result,
            timestamp: None,
            op_type: Some(op_type),
        }
    }

    /// Sets the server timestamp.
    pub fn with_timestamp(mut self, timestamp: Value) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }

    /// Decodes from a JSON value.
    pub fn decode(value: Value) -> ProtocolResult<Self> {
        decode(value)
    }
}

/// One-shot write request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    /// Write payload.
    pub body: Value,
    /// Whether the server should return the written document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_doc: Option<bool>,
    /// Event name the response arrives on.
    pub response_id: String,
    /// Route being written to.
    pub route_id: String,
}

impl WriteRequest {
    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }
}

/// Response to a write request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Server-reported error, if the write failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    /// Response data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WriteResponse {
    /// Creates a successful response.
    pub fn success(data: Value) -> Self {
        Self {
            err: None,
            data: Some(data),
        }
    }

    /// Creates a failed response.
    pub fn error(err: Value) -> Self {
        Self {
            err: Some(err),
            data: None,
        }
    }

    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }

    /// Decodes from a JSON value.
    pub fn decode(value: Value) -> ProtocolResult<Self> {
        decode(value)
    }

    /// Converts into the data on success or the error payload on failure.
    ///
    /// A null `err` counts as success.
    pub fn into_result(self) -> Result<Value, Value> {
        match self.err {
            Some(err) if !err.is_null() => Err(err),
            _ => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Asks the server to validate a read route the first time it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateSyncRequest {
    /// Stream kind tag of the route.
    pub sync_type: StreamKind,
    /// Route to validate.
    pub route_id: String,
}

impl ValidateSyncRequest {
    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }
}

/// Asks the server to validate a write route the first time it is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateWriteRequest {
    /// Response id of the write that triggered validation.
    pub response_id: String,
    /// Route to validate.
    pub route_id: String,
}

impl ValidateWriteRequest {
    /// Encodes to a JSON value.
    pub fn encode(&self) -> ProtocolResult<Value> {
        encode(self)
    }
}
