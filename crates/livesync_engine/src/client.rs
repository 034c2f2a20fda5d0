//! Public request façade.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use livesync_protocol::{
    events, fingerprint, IdGenerator, StreamKind, SubscribeRequest, UuidGenerator, WriteRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::diagnostic::Diagnostic;
use crate::engine::{self, CallCommand, Command, SubscribeCommand};
use crate::error::{SyncError, SyncResult};
use crate::store::ObserverHandle;
use crate::transport::Transport;

const DIAGNOSTIC_CAPACITY: usize = 64;

/// Client for a realtime sync server.
///
/// Cloning is not supported; share the client behind an `Arc` instead. All
/// state lives in a background engine task that stops once the client and
/// every subscription it produced are dropped.
pub struct SyncClient {
    config: ClientConfig,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    diagnostics: broadcast::Sender<Diagnostic>,
    ids: Arc<dyn IdGenerator>,
}

impl SyncClient {
    /// Creates a client over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T: Transport>(config: ClientConfig, transport: T) -> Self {
        Self::with_id_generator(config, transport, Arc::new(UuidGenerator))
    }

    /// Creates a client that draws observer and call ids from `ids`.
    pub fn with_id_generator<T: Transport>(
        config: ClientConfig,
        transport: T,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        let (commands, state) = engine::spawn(config.clone(), transport, diagnostics.clone());
        Self {
            config,
            commands,
            state,
            diagnostics,
            ids,
        }
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects and waits for the server to verify the client.
    ///
    /// Resolves immediately if already verified. Streams that survived an
    /// earlier [`disconnect`](Self::disconnect) are registered again.
    pub async fn connect(&self) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { reply })?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Closes the connection. Streams keep their last value.
    pub fn disconnect(&self) -> SyncResult<()> {
        self.send(Command::Disconnect)
    }

    /// Subscribes to a route.
    ///
    /// Subscriptions with the same route and body share one server stream.
    /// The subscription waits for verification before it is registered, and
    /// detaches when dropped.
    pub fn subscribe<R: DeserializeOwned>(
        &self,
        route_id: &str,
        body: impl Serialize,
    ) -> SyncResult<Subscription<R>> {
        let body = serde_json::to_value(body)?;
        let key = fingerprint(&self.config.project_id, route_id, "read", &body);
        let request = SubscribeRequest::new(key, route_id, StreamKind::Route, body);
        self.open(request, decode_json::<R>)
    }

    /// Subscribes to the server clock.
    ///
    /// Besides its own updates, the clock follows the timestamp of every
    /// operation event received on any stream.
    pub fn server_time(&self) -> SyncResult<Subscription<DateTime<Utc>>> {
        let request = SubscribeRequest::new(
            events::SERVER_TIME_KEY,
            events::SERVER_TIME_ROUTE,
            StreamKind::Utility,
            Value::Null,
        );
        self.open(request, decode_server_time)
    }

    /// Sends a one-shot write and waits for its response.
    ///
    /// Fails with [`SyncError::Remote`] when the server reports an error, and
    /// with [`SyncError::Timeout`] when a configured call timeout elapses.
    pub async fn call<R: DeserializeOwned>(
        &self,
        route_id: &str,
        payload: impl Serialize,
        get_doc: Option<bool>,
    ) -> SyncResult<R> {
        let body = serde_json::to_value(payload)?;
        let response_id = fingerprint(
            &self.config.project_id,
            route_id,
            &self.ids.next_id(),
            &body,
        );
        let request = WriteRequest {
            body,
            get_doc,
            response_id: response_id.clone(),
            route_id: route_id.to_string(),
        };

        let (reply, rx) = oneshot::channel();
        self.send(Command::Call(CallCommand { request, reply }))?;

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.commands.send(Command::CancelCall { response_id });
                    return Err(SyncError::Timeout);
                }
            },
            None => rx.await,
        };
        let data = outcome.map_err(|_| SyncError::Closed)??;
        Ok(serde_json::from_value(data)?)
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a watch handle on the connection state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Returns a receiver for diagnostics published from now on.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    fn open<R>(
        &self,
        request: SubscribeRequest,
        decode: fn(Value) -> SyncResult<R>,
    ) -> SyncResult<Subscription<R>> {
        let observer_id = self.ids.next_id();
        let key = request.response_id.clone();
        let (sink, receiver) = mpsc::unbounded_channel();

        self.send(Command::Subscribe(SubscribeCommand {
            request,
            observer: ObserverHandle::new(observer_id.clone(), sink),
        }))?;

        Ok(Subscription {
            key,
            observer_id,
            receiver,
            commands: self.commands.clone(),
            decode,
        })
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

fn decode_json<R: DeserializeOwned>(value: Value) -> SyncResult<R> {
    Ok(serde_json::from_value(value)?)
}

/// Server time arrives as an RFC 3339 string or as epoch milliseconds.
fn decode_server_time(value: Value) -> SyncResult<DateTime<Utc>> {
    match &value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|time| time.with_timezone(&Utc))
            .map_err(|e| SyncError::Codec(e.to_string())),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| SyncError::Codec(format!("invalid epoch milliseconds: {number}"))),
        other => Err(SyncError::Codec(format!("unexpected server time: {other}"))),
    }
}

/// One caller's view of a stream.
///
/// Yields every merged value of the stream, starting with the current value
/// if there is one. Dropping the subscription detaches it; the stream itself
/// is torn down after a grace delay if no other subscription remains.
pub struct Subscription<T> {
    key: String,
    observer_id: String,
    receiver: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<Command>,
    decode: fn(Value) -> SyncResult<T>,
}

impl<T> Subscription<T> {
    /// Returns the stream key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns this subscription's observer id.
    pub fn observer_id(&self) -> &str {
        &self.observer_id
    }

    /// Waits for the next value.
    ///
    /// Returns `None` once the engine has stopped.
    pub async fn next(&mut self) -> Option<SyncResult<T>> {
        let value = self.receiver.recv().await?;
        Some((self.decode)(value))
    }

    /// Returns the next value if one is already buffered.
    pub fn try_next(&mut self) -> Option<SyncResult<T>> {
        let value = self.receiver.try_recv().ok()?;
        Some((self.decode)(value))
    }

    /// Detaches from the stream.
    pub fn unsubscribe(self) {}
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("observer_id", &self.observer_id)
            .finish()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = SyncResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let decode = self.decode;
        self.receiver.poll_recv(cx).map(|value| value.map(decode))
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Detach {
            observer_id: std::mem::take(&mut self.observer_id),
            key: std::mem::take(&mut self.key),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_time_from_rfc3339() {
        let time = decode_server_time(json!("2024-05-01T10:00:00Z")).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn server_time_from_millis() {
        let time = decode_server_time(json!(1_714_557_600_000_i64)).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn server_time_rejects_other_shapes() {
        assert!(matches!(
            decode_server_time(json!({ "t": 1 })),
            Err(SyncError::Codec(_))
        ));
        assert!(matches!(
            decode_server_time(json!("yesterday")),
            Err(SyncError::Codec(_))
        ));
    }

    #[test]
    fn json_decode_errors_are_codec_errors() {
        let result: SyncResult<u32> = decode_json(json!("x"));
        assert!(matches!(result, Err(SyncError::Codec(_))));
    }
}
