//! Transport layer abstraction for the realtime connection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use livesync_protocol::events;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

/// Event reported by a transport to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The physical connection is up.
    Connected,
    /// The physical connection dropped on its own.
    Disconnected {
        /// Human readable reason.
        reason: String,
    },
    /// A connect attempt failed asynchronously.
    ConnectFailed {
        /// Human readable reason.
        reason: String,
    },
    /// A named message arrived.
    Message {
        /// Event name.
        event: String,
        /// Message payload.
        payload: Value,
    },
}

/// Channel a transport uses to report events to the engine.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A duplex, event-addressable connection to the realtime server.
///
/// Implementations wrap a concrete connection library. They must preserve
/// delivery order per event name, and must not report `Disconnected` for a
/// disconnect requested through [`Transport::disconnect`].
pub trait Transport: Send + Sync + 'static {
    /// Starts connecting. Events for this connection are sent to `events`.
    fn connect(&self, events: EventSender) -> SyncResult<()>;

    /// Closes the connection.
    fn disconnect(&self);

    /// Emits a named event.
    fn emit(&self, event: &str, payload: Value) -> SyncResult<()>;

    /// Starts forwarding messages for a named event.
    fn listen(&self, event: &str);

    /// Stops forwarding messages for a named event.
    fn unlisten(&self, event: &str);
}

/// How the mock answers verification requests.
#[derive(Debug, Clone, PartialEq)]
pub enum MockVerification {
    /// Reply with success as soon as the verify event is emitted.
    Accept,
    /// Reply with the given rejection payload.
    Reject(Value),
    /// Do not reply; the test delivers the outcome itself.
    Manual,
}

#[derive(Debug)]
struct MockState {
    events: Option<EventSender>,
    connected: bool,
    connect_error: Option<String>,
    verification: MockVerification,
    emitted: Vec<(String, Value)>,
    listening: BTreeSet<String>,
    unlistened: HashMap<String, usize>,
    connect_count: usize,
    disconnect_count: usize,
}

/// An in-memory transport for testing.
///
/// Clones share state, so a test can keep a handle while the client owns
/// another. Connecting succeeds immediately unless a connect error is set.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a mock that accepts verification.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                events: None,
                connected: false,
                connect_error: None,
                verification: MockVerification::Accept,
                emitted: Vec::new(),
                listening: BTreeSet::new(),
                unlistened: HashMap::new(),
                connect_count: 0,
                disconnect_count: 0,
            })),
        }
    }

    /// Sets how verification requests are answered.
    pub fn set_verification(&self, verification: MockVerification) {
        self.state.lock().verification = verification;
    }

    /// Makes subsequent connect attempts fail with `reason`.
    pub fn set_connect_error(&self, reason: impl Into<String>) {
        self.state.lock().connect_error = Some(reason.into());
    }

    /// Lets subsequent connect attempts succeed again.
    pub fn clear_connect_error(&self) {
        self.state.lock().connect_error = None;
    }

    /// Delivers a named message to the engine.
    ///
    /// Returns false if the mock has never been connected.
    pub fn deliver(&self, event: &str, payload: Value) -> bool {
        self.send(TransportEvent::Message {
            event: event.to_string(),
            payload,
        })
    }

    /// Simulates the connection dropping on its own.
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.state.lock().connected = false;
        self.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
    }

    /// Returns every emitted event in order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.state.lock().emitted.clone()
    }

    /// Returns the payloads emitted on `event`.
    pub fn emitted_on(&self, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .emitted
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Returns how many times `event` was emitted.
    pub fn emit_count(&self, event: &str) -> usize {
        self.state
            .lock()
            .emitted
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Clears the emitted event log.
    pub fn clear_emitted(&self) {
        self.state.lock().emitted.clear();
    }

    /// Returns true if the engine is listening for `event`.
    pub fn is_listening(&self, event: &str) -> bool {
        self.state.lock().listening.contains(event)
    }

    /// Returns how many times `event` was unlistened.
    pub fn unlisten_count(&self, event: &str) -> usize {
        self.state
            .lock()
            .unlistened
            .get(event)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of connect attempts.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    /// Returns the number of disconnects requested by the engine.
    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnect_count
    }

    /// Returns true if the mock is connected.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn send(&self, event: TransportEvent) -> bool {
        let state = self.state.lock();
        match &state.events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn connect(&self, events: EventSender) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.connect_count += 1;

        if let Some(reason) = &state.connect_error {
            return Err(SyncError::transport_retryable(reason.clone()));
        }

        state.connected = true;
        let _ = events.send(TransportEvent::Connected);
        state.events = Some(events);
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.disconnect_count += 1;
    }

    fn emit(&self, event: &str, payload: Value) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(SyncError::transport_retryable("not connected"));
        }

        state.emitted.push((event.to_string(), payload));

        if event == events::CLIENT_VERIFY_SOCKET {
            let reply = match &state.verification {
                MockVerification::Accept => Some((events::VERIFICATION_SUCCESS, Value::Null)),
                MockVerification::Reject(payload) => {
                    Some((events::VERIFICATION_ERROR, payload.clone()))
                }
                MockVerification::Manual => None,
            };
            if let (Some((name, payload)), Some(events)) = (reply, &state.events) {
                let _ = events.send(TransportEvent::Message {
                    event: name.to_string(),
                    payload,
                });
            }
        }
        Ok(())
    }

    fn listen(&self, event: &str) {
        self.state.lock().listening.insert(event.to_string());
    }

    fn unlisten(&self, event: &str) {
        let mut state = self.state.lock();
        state.listening.remove(event);
        *state.unlistened.entry(event.to_string()).or_insert(0) += 1;
    }
}
