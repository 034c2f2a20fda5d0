//! Operation and stream kind codes.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Kind of incremental change carried by an operation event.
///
/// Codes outside the known range decode to [`OperationKind::Unsupported`]
/// instead of failing, so a single bad event can be rejected by the merge
/// step without poisoning the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum OperationKind {
    /// A document was created.
    Create,
    /// A document was updated.
    Update,
    /// A document was deleted.
    Delete,
    /// A code this client does not understand.
    Unsupported(u8),
}

impl OperationKind {
    /// Converts to the numeric wire code.
    pub fn to_code(&self) -> u8 {
        match self {
            OperationKind::Create => 1,
            OperationKind::Update => 2,
            OperationKind::Delete => 3,
            OperationKind::Unsupported(code) => *code,
        }
    }

    /// Converts from a numeric wire code.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => OperationKind::Create,
            2 => OperationKind::Update,
            3 => OperationKind::Delete,
            other => OperationKind::Unsupported(other),
        }
    }

    /// Returns true for create, update and delete.
    pub fn is_supported(&self) -> bool {
        !matches!(self, OperationKind::Unsupported(_))
    }
}

impl From<u8> for OperationKind {
    fn from(code: u8) -> Self {
        Self::from_code(code)
    }
}

impl From<OperationKind> for u8 {
    fn from(kind: OperationKind) -> Self {
        kind.to_code()
    }
}

/// Kind of stream a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StreamKind {
    /// A user-defined read route.
    Route,
    /// A built-in utility stream such as server time.
    Utility,
}

impl StreamKind {
    /// Converts to the numeric wire code.
    pub fn to_code(&self) -> u8 {
        match self {
            StreamKind::Route => 1,
            StreamKind::Utility => 2,
        }
    }

    /// Converts from a numeric wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StreamKind::Route),
            2 => Some(StreamKind::Utility),
            _ => None,
        }
    }
}

impl TryFrom<u8> for StreamKind {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(ProtocolError::UnknownStreamKind(code))
    }
}

impl From<StreamKind> for u8 {
    fn from(kind: StreamKind) -> Self {
        kind.to_code()
    }
}
