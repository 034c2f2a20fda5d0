//! # livesync engine
//!
//! Realtime sync client for livesync servers.
//!
//! This crate provides:
//! - Stream store with incremental merge (create/update/delete by identity)
//! - Subscription deduplication with a teardown grace period
//! - Connection state machine (disconnected → verifying → verified)
//! - Reconnection with stream replay
//! - One-shot write calls and a server clock stream
//! - Transport abstraction with an in-memory mock
//!
//! ## Architecture
//!
//! A single engine task owns all state. The [`SyncClient`] sends it commands,
//! the [`Transport`] sends it events, and timers wake it for teardown and
//! reconnection. Every merged value is copied into each [`Subscription`], so
//! subscribers never share mutable data.
//!
//! ## Key Invariants
//!
//! - At most one server stream per stream key
//! - Wire operations only run while verified; earlier requests are queued
//! - Operation events for a stream are applied in delivery order
//! - A merge failure affects one event on one stream only
//! - Reconnection keeps streams, their values and their subscribers

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod connection;
mod diagnostic;
mod engine;
mod error;
pub mod store;
mod transport;

pub use client::{Subscription, SyncClient};
pub use config::{ClientConfig, ReconnectPolicy, DEFAULT_GRACE_DELAY};
pub use connection::ConnectionState;
pub use diagnostic::Diagnostic;
pub use error::{SyncError, SyncResult};
pub use store::{ObserverHandle, StreamStore};
pub use transport::{EventSender, MockTransport, MockVerification, Transport, TransportEvent};
