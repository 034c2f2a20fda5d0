//! # livesync protocol
//!
//! Wire message types and stream keys for the livesync realtime protocol.
//!
//! This crate provides:
//! - `OperationKind` and `StreamKind` wire codes
//! - Message shapes (subscribe request, operation event, write request/response)
//! - Well-known control event names
//! - Stream key fingerprinting and id generation
//!
//! This is a pure protocol crate with no I/O operations. Messages are JSON
//! values with camelCase field names.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod events;
mod fingerprint;
mod messages;
mod operation;

pub use error::{ProtocolError, ProtocolResult};
pub use fingerprint::{fingerprint, IdGenerator, UuidGenerator};
pub use messages::{
    OperationEvent, SubscribeRequest, ValidateSyncRequest, ValidateWriteRequest, VerifyRequest,
    WriteRequest, WriteResponse,
};
pub use operation::{OperationKind, StreamKind};
