//! Connection state machine.

use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::error::{SyncError, SyncResult};

/// The current state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Disconnected,
    /// Connected (or connecting) and waiting for the server to verify us.
    Verifying,
    /// Verified; wire operations may run.
    Verified,
    /// The connection dropped and a new one is being established.
    Reconnecting,
}

impl ConnectionState {
    /// Returns true if wire operations may run.
    pub fn is_verified(&self) -> bool {
        matches!(self, ConnectionState::Verified)
    }

    /// Returns true while a connect or verify cycle is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Verifying | ConnectionState::Reconnecting
        )
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (*self, next),
            (Disconnected, Verifying)
                | (Verifying, Verified)
                | (Verifying, Disconnected)
                | (Verifying, Reconnecting)
                | (Verified, Reconnecting)
                | (Verified, Disconnected)
                | (Reconnecting, Verifying)
                | (Reconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Verifying => "verifying",
            ConnectionState::Verified => "verified",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Tracks the connection state and publishes every change.
#[derive(Debug)]
pub(crate) struct Connection {
    state: ConnectionState,
    notify: watch::Sender<ConnectionState>,
    /// Reconnect attempts made for the current drop; zero outside a
    /// reconnect cycle.
    attempts: u32,
}

impl Connection {
    pub(crate) fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (notify, receiver) = watch::channel(ConnectionState::Disconnected);
        let connection = Self {
            state: ConnectionState::Disconnected,
            notify,
            attempts: 0,
        };
        (connection, receiver)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub(crate) fn transition(&mut self, next: ConnectionState) -> SyncResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        info!(from = %self.state, to = %next, "connection state changed");
        self.state = next;
        self.notify.send_replace(next);
        Ok(())
    }

    pub(crate) fn in_reconnect_cycle(&self) -> bool {
        self.attempts > 0
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a new reconnect attempt and returns its 1-based number.
    pub(crate) fn next_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}
