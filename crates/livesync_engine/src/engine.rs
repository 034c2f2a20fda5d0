//! The engine task.
//!
//! A single task owns the stream store, the connection state and every
//! pending request. Callers, the transport and timers talk to it only through
//! channels, and each message is handled to completion before the next one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use livesync_protocol::{
    events, OperationEvent, ProtocolResult, StreamKind, SubscribeRequest, ValidateSyncRequest,
    ValidateWriteRequest, VerifyRequest, WriteRequest, WriteResponse,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::diagnostic::Diagnostic;
use crate::error::{SyncError, SyncResult};
use crate::store::{ObserverHandle, OrphanTicket, StreamStore};
use crate::transport::{EventSender, Transport, TransportEvent};

/// A request from the client side.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Disconnect,
    Subscribe(SubscribeCommand),
    Detach {
        observer_id: String,
        key: String,
    },
    Call(CallCommand),
    CancelCall {
        response_id: String,
    },
}

#[derive(Debug)]
pub(crate) struct SubscribeCommand {
    pub(crate) request: SubscribeRequest,
    pub(crate) observer: ObserverHandle,
}

#[derive(Debug)]
pub(crate) struct CallCommand {
    pub(crate) request: WriteRequest,
    pub(crate) reply: oneshot::Sender<SyncResult<Value>>,
}

/// A delayed wake-up.
#[derive(Debug)]
pub(crate) enum Timer {
    GraceExpired(OrphanTicket),
    Reconnect,
}

/// Work parked until the connection is verified.
#[derive(Debug)]
enum Queued {
    Subscribe(SubscribeCommand),
    Call(CallCommand),
}

pub(crate) struct Engine<T: Transport> {
    config: ClientConfig,
    transport: T,
    store: StreamStore,
    connection: Connection,
    queue: VecDeque<Queued>,
    connect_waiters: Vec<oneshot::Sender<SyncResult<()>>>,
    calls: HashMap<String, oneshot::Sender<SyncResult<Value>>>,
    checked_routes: HashSet<String>,
    checked_write_routes: HashSet<String>,
    events_tx: EventSender,
    timers_tx: mpsc::UnboundedSender<Timer>,
    diagnostics: broadcast::Sender<Diagnostic>,
}

/// Starts an engine task and returns its command channel and state watch.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn<T: Transport>(
    config: ClientConfig,
    transport: T,
    diagnostics: broadcast::Sender<Diagnostic>,
) -> (
    mpsc::UnboundedSender<Command>,
    watch::Receiver<ConnectionState>,
) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (timers_tx, timers_rx) = mpsc::unbounded_channel();

    let (engine, state) = Engine::new(config, transport, diagnostics, events_tx, timers_tx);
    tokio::spawn(engine.run(commands_rx, events_rx, timers_rx));
    (commands_tx, state)
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(
        config: ClientConfig,
        transport: T,
        diagnostics: broadcast::Sender<Diagnostic>,
        events_tx: EventSender,
        timers_tx: mpsc::UnboundedSender<Timer>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (connection, state) = Connection::new();

        for event in [
            events::VERIFICATION_SUCCESS,
            events::VERIFICATION_ERROR,
            events::RECONNECTION_TRIGGER,
        ] {
            transport.listen(event);
        }
        transport.listen(&events::validate_sync_error_event());

        let engine = Self {
            store: StreamStore::new(config.identity_field.clone()),
            config,
            transport,
            connection,
            queue: VecDeque::new(),
            connect_waiters: Vec::new(),
            calls: HashMap::new(),
            checked_routes: HashSet::new(),
            checked_write_routes: HashSet::new(),
            events_tx,
            timers_tx,
            diagnostics,
        };
        (engine, state)
    }

    /// Processes messages until every command sender is gone.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut timers: mpsc::UnboundedReceiver<Timer>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(timer) = timers.recv() => self.handle_timer(timer),
            }
        }
        self.shutdown();
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.handle_connect(reply),
            Command::Disconnect => self.handle_disconnect(),
            Command::Subscribe(command) => self.handle_subscribe(command),
            Command::Detach { observer_id, key } => self.handle_detach(&observer_id, &key),
            Command::Call(command) => self.handle_call(command),
            Command::CancelCall { response_id } => self.handle_cancel_call(&response_id),
        }
    }

    pub(crate) fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
            TransportEvent::ConnectFailed { reason } => {
                if self.connection.state().is_pending() {
                    self.connection_failed(SyncError::transport_retryable(reason));
                }
            }
            TransportEvent::Message { event, payload } => self.on_message(&event, payload),
        }
    }

    pub(crate) fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::GraceExpired(ticket) => self.on_grace_expired(ticket),
            Timer::Reconnect => {
                if self.connection.state() == ConnectionState::Reconnecting {
                    self.attempt_reconnect();
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &StreamStore {
        &self.store
    }

    // Connection lifecycle

    fn handle_connect(&mut self, reply: oneshot::Sender<SyncResult<()>>) {
        match self.connection.state() {
            ConnectionState::Verified => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Verifying | ConnectionState::Reconnecting => {
                self.connect_waiters.push(reply);
            }
            ConnectionState::Disconnected => {
                self.connect_waiters.push(reply);
                self.set_state(ConnectionState::Verifying);
                info!(project_id = %self.config.project_id, "connecting");
                if let Err(e) = self.transport.connect(self.events_tx.clone()) {
                    self.connection_failed(e);
                }
            }
        }
    }

    fn handle_disconnect(&mut self) {
        if self.connection.state() == ConnectionState::Disconnected {
            return;
        }
        info!("disconnecting");
        self.transport.disconnect();
        self.set_state(ConnectionState::Disconnected);
        self.connection.reset_attempts();
        self.fail_pending(SyncError::transport_fatal("disconnected by client"));
    }

    fn on_connected(&mut self) {
        match self.connection.state() {
            ConnectionState::Reconnecting => self.set_state(ConnectionState::Verifying),
            ConnectionState::Verifying => {}
            state => {
                trace!(%state, "ignoring connected event");
                return;
            }
        }

        debug!("transport connected, verifying");
        let request = VerifyRequest::new(self.config.project_id.clone());
        if let Err(e) = self.emit(events::CLIENT_VERIFY_SOCKET, request.encode()) {
            self.connection_failed(e);
        }
    }

    fn on_verified(&mut self) {
        if self.connection.state() != ConnectionState::Verifying {
            trace!("ignoring verification outside of a handshake");
            return;
        }

        let reconnected = self.connection.in_reconnect_cycle();
        self.set_state(ConnectionState::Verified);
        self.connection.reset_attempts();

        self.replay();
        while let Some(queued) = self.queue.pop_front() {
            match queued {
                Queued::Subscribe(command) => self.handle_subscribe(command),
                Queued::Call(command) => self.handle_call(command),
            }
        }

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if reconnected {
            info!(streams = self.store.len(), "reconnected");
            self.publish(Diagnostic::Reconnected);
        }
    }

    /// Re-registers every stream with the server after verification.
    fn replay(&mut self) {
        let requests: Vec<SubscribeRequest> = self
            .store
            .all_streams()
            .map(|stream| stream.request().clone())
            .collect();

        for request in requests {
            debug!(key = %request.response_id, "replaying stream");
            if let Err(e) = self.emit_subscribe(&request) {
                warn!(key = %request.response_id, error = %e, "failed to replay stream");
            }
        }
    }

    fn on_reconnect_trigger(&mut self) {
        if self.connection.state() != ConnectionState::Verified {
            return;
        }
        info!("server requested reconnection");
        self.set_state(ConnectionState::Reconnecting);
        self.transport.disconnect();
        self.attempt_reconnect();
    }

    fn on_disconnected(&mut self, reason: String) {
        match self.connection.state() {
            ConnectionState::Verified => {
                warn!(%reason, "connection lost");
                self.set_state(ConnectionState::Reconnecting);
                self.publish(Diagnostic::ConnectionLost { reason });
                self.attempt_reconnect();
            }
            ConnectionState::Verifying => {
                self.connection_failed(SyncError::transport_retryable(reason));
            }
            state => trace!(%state, %reason, "ignoring disconnect"),
        }
    }

    fn attempt_reconnect(&mut self) {
        let attempt = self.connection.next_attempt();
        info!(attempt, "reconnecting");
        if let Err(e) = self.transport.connect(self.events_tx.clone()) {
            self.connection_failed(e);
        }
    }

    /// Handles a failed connect or verify cycle.
    ///
    /// Inside a reconnect cycle, retryable errors are retried while the
    /// policy allows; anything else gives up and leaves streams as they are.
    fn connection_failed(&mut self, error: SyncError) {
        let reconnecting = self.connection.in_reconnect_cycle();
        let attempts = self.connection.attempts();
        let policy = &self.config.reconnect;

        self.transport.disconnect();

        if reconnecting && error.is_retryable() && attempts < policy.max_attempts {
            let delay = policy.delay_for_attempt(attempts + 1);
            warn!(attempt = attempts, error = %error, ?delay, "reconnect attempt failed, retrying");
            self.set_state(ConnectionState::Reconnecting);
            self.schedule(delay, Timer::Reconnect);
            return;
        }

        warn!(error = %error, "connection failed");
        self.set_state(ConnectionState::Disconnected);
        self.connection.reset_attempts();
        self.fail_pending(error.clone());
        if reconnecting {
            self.publish(Diagnostic::ReconnectFailed {
                error: error.to_string(),
            });
        }
    }

    /// Fails connect waiters and every call that cannot complete anymore.
    fn fail_pending(&mut self, error: SyncError) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }

        let calls: Vec<String> = self.calls.keys().cloned().collect();
        for response_id in calls {
            self.resolve_call(&response_id, Err(error.clone()));
        }

        let mut kept = VecDeque::with_capacity(self.queue.len());
        for queued in self.queue.drain(..) {
            match queued {
                Queued::Call(command) => {
                    let _ = command.reply.send(Err(error.clone()));
                }
                subscribe => kept.push_back(subscribe),
            }
        }
        self.queue = kept;
    }

    // Streams

    fn handle_subscribe(&mut self, command: SubscribeCommand) {
        if !self.connection.state().is_verified() {
            trace!(key = %command.request.response_id, "queueing subscribe until verified");
            self.queue.push_back(Queued::Subscribe(command));
            return;
        }

        let SubscribeCommand { request, observer } = command;
        let key = request.response_id.clone();
        let observer_id = observer.id().to_string();

        if self.store.contains(&key) {
            match self.store.attach(&key, observer) {
                Ok(()) => debug!(%key, %observer_id, "observer attached"),
                Err(e) => warn!(%key, error = %e, "failed to attach observer"),
            }
            return;
        }

        let kind = request.sync_type;
        if let Err(e) = self.store.create(request.clone(), kind, observer) {
            warn!(%key, error = %e, "failed to create stream");
            return;
        }
        debug!(%key, route_id = %request.route_id, %observer_id, "stream created");

        self.transport.listen(&key);
        self.transport.listen(&events::error_event(&key));
        if let Err(e) = self.emit_subscribe(&request) {
            // The stream is kept and registered again on the next verification.
            warn!(%key, error = %e, "failed to register stream");
        }
        self.validate_route(&request.route_id, kind);
    }

    fn emit_subscribe(&self, request: &SubscribeRequest) -> SyncResult<()> {
        let event = events::read_event(&self.config.project_id, &request.route_id);
        self.emit(&event, request.encode())
    }

    fn validate_route(&mut self, route_id: &str, sync_type: StreamKind) {
        if !self.checked_routes.insert(route_id.to_string()) {
            return;
        }
        let request = ValidateSyncRequest {
            sync_type,
            route_id: route_id.to_string(),
        };
        let event = events::utility_event(&self.config.project_id, events::VALIDATE_SYNC);
        if let Err(e) = self.emit(&event, request.encode()) {
            warn!(%route_id, error = %e, "failed to validate route");
        }
    }

    fn handle_detach(&mut self, observer_id: &str, key: &str) {
        let queued = self.queue.len();
        self.queue.retain(|entry| {
            !matches!(entry, Queued::Subscribe(command) if command.observer.id() == observer_id)
        });
        if self.queue.len() != queued {
            debug!(%key, %observer_id, "queued subscribe cancelled");
            return;
        }

        if let Some(ticket) = self.store.detach(observer_id, key) {
            debug!(%key, "stream has no observers, scheduling teardown");
            self.schedule(self.config.grace_delay, Timer::GraceExpired(ticket));
        }
    }

    fn on_grace_expired(&mut self, ticket: OrphanTicket) {
        if !self.store.is_orphaned(&ticket) {
            trace!(key = ticket.key(), "stream reattached during grace period");
            return;
        }

        let key = ticket.key();
        self.store.remove(key);
        self.transport.unlisten(key);
        self.transport.unlisten(&events::error_event(key));
        debug!(%key, "stream torn down");
    }

    fn on_operation(&mut self, key: &str, payload: Value) {
        let event = match OperationEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(%key, error = %e, "malformed operation event");
                self.publish(Diagnostic::RejectedOperation {
                    key: key.to_string(),
                    error: e.to_string(),
                });
                return;
            }
        };

        let timestamp = event.timestamp.clone();
        match self.store.apply_operation(key, event) {
            Ok(delivered) => trace!(%key, delivered, "operation applied"),
            Err(SyncError::StaleEvent { .. }) => trace!(%key, "dropping stale event"),
            Err(e) => {
                warn!(%key, error = %e, "operation rejected");
                self.publish(Diagnostic::RejectedOperation {
                    key: key.to_string(),
                    error: e.to_string(),
                });
            }
        }

        if let Some(timestamp) = timestamp.filter(|ts| !ts.is_null()) {
            self.refresh_server_time(key, timestamp);
        }
    }

    fn refresh_server_time(&mut self, source: &str, timestamp: Value) {
        if source == events::SERVER_TIME_KEY || !self.store.contains(events::SERVER_TIME_KEY) {
            return;
        }
        if let Err(e) = self
            .store
            .apply_operation(events::SERVER_TIME_KEY, OperationEvent::snapshot(timestamp))
        {
            warn!(error = %e, "failed to refresh server time");
        }
    }

    // Calls

    fn handle_call(&mut self, command: CallCommand) {
        if !self.connection.state().is_verified() {
            trace!(response_id = %command.request.response_id, "queueing call until verified");
            self.queue.push_back(Queued::Call(command));
            return;
        }

        let CallCommand { request, reply } = command;
        let response_id = request.response_id.clone();

        self.transport.listen(&response_id);
        self.transport.listen(&events::error_event(&response_id));
        self.calls.insert(response_id.clone(), reply);

        let event = events::write_event(&self.config.project_id, &request.route_id);
        if let Err(e) = self.emit(&event, request.encode()) {
            self.resolve_call(&response_id, Err(e));
            return;
        }
        debug!(%response_id, route_id = %request.route_id, "call sent");

        if self.checked_write_routes.insert(request.route_id.clone()) {
            let validate = ValidateWriteRequest {
                response_id,
                route_id: request.route_id,
            };
            let event = events::utility_event(&self.config.project_id, events::VALIDATE_WRITE);
            if let Err(e) = self.emit(&event, validate.encode()) {
                warn!(error = %e, "failed to validate write route");
            }
        }
    }

    fn handle_cancel_call(&mut self, response_id: &str) {
        self.queue.retain(|entry| {
            !matches!(entry, Queued::Call(command) if command.request.response_id == response_id)
        });
        if self.calls.remove(response_id).is_some() {
            self.transport.unlisten(response_id);
            self.transport.unlisten(&events::error_event(response_id));
            debug!(%response_id, "call cancelled");
        }
    }

    fn resolve_call(&mut self, response_id: &str, result: SyncResult<Value>) {
        let Some(reply) = self.calls.remove(response_id) else {
            return;
        };
        self.transport.unlisten(response_id);
        self.transport.unlisten(&events::error_event(response_id));
        let _ = reply.send(result);
    }

    // Inbound routing

    fn on_message(&mut self, event: &str, payload: Value) {
        match event {
            events::VERIFICATION_SUCCESS => return self.on_verified(),
            events::VERIFICATION_ERROR => {
                if self.connection.state() == ConnectionState::Verifying {
                    self.connection_failed(SyncError::Handshake(payload));
                }
                return;
            }
            events::RECONNECTION_TRIGGER => return self.on_reconnect_trigger(),
            _ => {}
        }

        if event == events::validate_sync_error_event() {
            warn!(error = %payload, "route rejected");
            self.publish(Diagnostic::RouteRejected { error: payload });
            return;
        }

        if self.calls.contains_key(event) {
            let result = WriteResponse::decode(payload)
                .map_err(SyncError::from)
                .and_then(|response| response.into_result().map_err(SyncError::Remote));
            self.resolve_call(event, result);
            return;
        }

        if self.store.contains(event) {
            self.on_operation(event, payload);
            return;
        }

        if let Some(id) = events::strip_error_suffix(event) {
            if self.calls.contains_key(id) {
                self.resolve_call(id, Err(SyncError::Remote(payload)));
                return;
            }
            if self.store.contains(id) {
                warn!(key = %id, error = %payload, "stream error");
                self.publish(Diagnostic::StreamError {
                    key: id.to_string(),
                    error: payload,
                });
                return;
            }
        }

        trace!(%event, "ignoring unrouted message");
    }

    // Helpers

    fn emit(&self, event: &str, payload: ProtocolResult<Value>) -> SyncResult<()> {
        self.transport.emit(event, payload?)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if let Err(e) = self.connection.transition(next) {
            warn!(error = %e, "ignoring connection state change");
        }
    }

    fn publish(&self, diagnostic: Diagnostic) {
        // No receivers is fine.
        let _ = self.diagnostics.send(diagnostic);
    }

    fn schedule(&self, delay: Duration, timer: Timer) {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(timer);
        });
    }

    fn shutdown(&mut self) {
        debug!("engine stopped");
        if self.connection.state() != ConnectionState::Disconnected {
            self.transport.disconnect();
            self.set_state(ConnectionState::Disconnected);
        }
        self.fail_pending(SyncError::Closed);
    }
}
