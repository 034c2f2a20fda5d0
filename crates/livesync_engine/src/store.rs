//! Stream store and incremental merge.
//!
//! The store owns one [`Stream`] per stream key. Each stream caches the last
//! merged value and the observers attached to it. Every merged value is
//! cloned separately into each observer's sink, so no two observers (and not
//! the cache) ever share a mutable value.
//!
//! # Merge rules
//!
//! | current value | op type          | result                               |
//! |---------------|------------------|--------------------------------------|
//! | any           | none             | replaced wholesale                   |
//! | list          | create           | appended                             |
//! | list          | update           | replaced by identity, else appended  |
//! | list          | delete           | removed by identity, else unchanged  |
//! | document      | delete, same id  | null                                 |
//! | document      | other, same id   | replaced                             |
//! | other         | any              | dropped as stale                     |
//!
//! Unknown op types on a list fail that single event.

use std::collections::HashMap;

use livesync_protocol::{OperationEvent, OperationKind, StreamKind, SubscribeRequest};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};

/// Receiving end of an observer's merged values.
pub type ObserverSink = mpsc::UnboundedSender<Value>;

/// One caller's attachment to a stream.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: String,
    sink: ObserverSink,
}

impl ObserverHandle {
    /// Creates an observer handle.
    pub fn new(id: impl Into<String>, sink: ObserverSink) -> Self {
        Self {
            id: id.into(),
            sink,
        }
    }

    /// Returns the observer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends a value; returns false if the observer has gone away.
    fn deliver(&self, value: Value) -> bool {
        self.sink.send(value).is_ok()
    }
}

/// A server-pushed subscription and its cached value.
#[derive(Debug)]
pub struct Stream {
    request: SubscribeRequest,
    kind: StreamKind,
    current: Option<Value>,
    observers: HashMap<String, ObserverHandle>,
    orphan_epoch: u64,
}

impl Stream {
    /// Returns the stream key.
    pub fn key(&self) -> &str {
        &self.request.response_id
    }

    /// Returns the subscribe request that created this stream.
    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }

    /// Returns the route this stream reads from.
    pub fn route_id(&self) -> &str {
        &self.request.route_id
    }

    /// Returns the stream kind.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Returns the cached value, or `None` if nothing has arrived yet.
    ///
    /// A deleted single-document stream holds `Some(Value::Null)`.
    pub fn current_value(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    /// Returns the number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Returns the ids of all attached observers.
    pub fn observer_ids(&self) -> Vec<String> {
        self.observers.keys().cloned().collect()
    }

    /// Returns true if `observer_id` is attached.
    pub fn has_observer(&self, observer_id: &str) -> bool {
        self.observers.contains_key(observer_id)
    }

    /// Sends a copy of the current value to every observer.
    fn fan_out(&self) -> usize {
        let Some(value) = &self.current else {
            return 0;
        };
        self.observers
            .values()
            .filter(|observer| observer.deliver(value.clone()))
            .count()
    }
}

/// Proof that a stream became observer-less at a point in time.
///
/// Any later attach or detach on the stream invalidates the ticket, so a
/// grace timer can only tear down the stream it was scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanTicket {
    key: String,
    epoch: u64,
}

impl OrphanTicket {
    /// Returns the stream key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Table of active streams.
#[derive(Debug)]
pub struct StreamStore {
    streams: HashMap<String, Stream>,
    order: Vec<String>,
    identity_field: String,
}

impl StreamStore {
    /// Creates an empty store that identifies documents by `identity_field`.
    pub fn new(identity_field: impl Into<String>) -> Self {
        Self {
            streams: HashMap::new(),
            order: Vec::new(),
            identity_field: identity_field.into(),
        }
    }

    /// Looks up a stream.
    pub fn lookup(&self, key: &str) -> Option<&Stream> {
        self.streams.get(key)
    }

    /// Returns true if a stream exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }

    /// Returns the number of streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if there are no streams.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Creates a stream with a single observer and no value.
    ///
    /// Callers must check [`lookup`](Self::lookup) first; a second stream for
    /// the same key is an invariant violation.
    pub fn create(
        &mut self,
        request: SubscribeRequest,
        kind: StreamKind,
        observer: ObserverHandle,
    ) -> SyncResult<&Stream> {
        let key = request.response_id.clone();
        if self.streams.contains_key(&key) {
            return Err(SyncError::DuplicateStream(key));
        }

        let mut observers = HashMap::new();
        observers.insert(observer.id.clone(), observer);

        self.order.push(key.clone());
        let stream = self.streams.entry(key).or_insert(Stream {
            request,
            kind,
            current: None,
            observers,
            orphan_epoch: 0,
        });
        Ok(&*stream)
    }

    /// Attaches an observer to an existing stream.
    ///
    /// If the stream already has a value, the new observer receives a copy
    /// of it immediately.
    pub fn attach(&mut self, key: &str, observer: ObserverHandle) -> SyncResult<()> {
        let stream = self
            .streams
            .get_mut(key)
            .ok_or_else(|| SyncError::UnknownStream(key.to_string()))?;

        if let Some(value) = &stream.current {
            observer.deliver(value.clone());
        }
        stream.orphan_epoch += 1;
        stream.observers.insert(observer.id.clone(), observer);
        Ok(())
    }

    /// Detaches an observer.
    ///
    /// Returns a ticket when this left the stream without observers; the
    /// caller should run [`is_orphaned`](Self::is_orphaned) with it after the
    /// grace delay. Unknown streams or observers are ignored.
    pub fn detach(&mut self, observer_id: &str, key: &str) -> Option<OrphanTicket> {
        let stream = self.streams.get_mut(key)?;
        stream.observers.remove(observer_id)?;
        stream.orphan_epoch += 1;

        stream.observers.is_empty().then(|| OrphanTicket {
            key: key.to_string(),
            epoch: stream.orphan_epoch,
        })
    }

    /// Returns true if the stream is still observer-less and untouched since
    /// the ticket was issued.
    pub fn is_orphaned(&self, ticket: &OrphanTicket) -> bool {
        self.streams
            .get(&ticket.key)
            .map(|stream| stream.orphan_epoch == ticket.epoch && stream.observers.is_empty())
            .unwrap_or(false)
    }

    /// Removes a stream.
    pub fn remove(&mut self, key: &str) -> Option<Stream> {
        let stream = self.streams.remove(key)?;
        self.order.retain(|k| k != key);
        Some(stream)
    }

    /// Returns all streams in creation order.
    pub fn all_streams(&self) -> impl Iterator<Item = &Stream> {
        self.order.iter().filter_map(|key| self.streams.get(key))
    }

    /// Merges an operation event into a stream and fans the result out.
    ///
    /// Returns the number of observers that received the new value.
    pub fn apply_operation(&mut self, key: &str, event: OperationEvent) -> SyncResult<usize> {
        let stream = self
            .streams
            .get_mut(key)
            .ok_or_else(|| SyncError::UnknownStream(key.to_string()))?;

        merge(&mut stream.current, event, &self.identity_field, key)?;
        Ok(stream.fan_out())
    }
}

fn identity<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    doc.get(field).filter(|id| !id.is_null())
}

/// Documents without an identity never match anything.
fn same_identity(a: &Value, b: &Value, field: &str) -> bool {
    match (identity(a, field), identity(b, field)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn position(items: &[Value], doc: &Value, field: &str) -> Option<usize> {
    items
        .iter()
        .position(|item| same_identity(item, doc, field))
}

fn merge(
    current: &mut Option<Value>,
    event: OperationEvent,
    field: &str,
    key: &str,
) -> SyncResult<()> {
    let Some(op_type) = event.op_type else {
        *current = Some(event.result);
        return Ok(());
    };

    match current {
        Some(Value::Array(items)) => match op_type {
            OperationKind::Create => items.push(event.result),
            OperationKind::Update => match position(items, &event.result, field) {
                Some(index) => items[index] = event.result,
                None => items.push(event.result),
            },
            OperationKind::Delete => {
                if let Some(index) = position(items, &event.result, field) {
                    items.remove(index);
                }
            }
            OperationKind::Unsupported(code) => {
                return Err(SyncError::UnsupportedOperation {
                    key: key.to_string(),
                    code,
                })
            }
        },
        Some(doc) if same_identity(doc, &event.result, field) => {
            *doc = match op_type {
                OperationKind::Delete => Value::Null,
                _ => event.result,
            };
        }
        _ => {
            return Err(SyncError::StaleEvent {
                key: key.to_string(),
            })
        }
    }
    Ok(())
}
