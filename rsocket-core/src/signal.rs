//! Handles through which applications drive streams.
//!
//! Applications never touch a state machine. They hold a [`StreamHandle`]
//! (one per stream) or a [`Requester`] (one per connection) and every call
//! becomes a [`Signal`] on the connection's queue. The connection applies
//! signals in order, on the same thread of control that handles frames.

use crate::error::RSocketError;
use crate::subscriber::{ChannelSubscriber, ExtensionReceiver, Subscriber, Subscription};
use bytes::Bytes;
use rsocket_protocol::Payload;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection-local identity of a stream, independent of its stream ID.
///
/// A requester waiting for lease budget has a key but no stream ID yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(u64);

impl StreamKey {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocator shared by the multiplexer and its requesters.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyAllocator(Arc<AtomicU64>);

impl KeyAllocator {
    pub(crate) fn next(&self) -> StreamKey {
        StreamKey(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Local event addressed to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// Emit an item; `complete` fuses COMPLETE onto it.
    Next { payload: Payload, complete: bool },
    Complete,
    Error(RSocketError),
    Extension {
        extended_type: u32,
        content: Bytes,
        can_be_ignored: bool,
    },
    /// Grant the peer demand for `n` more items.
    Request(u32),
    Cancel,
}

/// A locally-initiated request waiting to be opened.
pub enum OpenRequest {
    FireAndForget {
        payload: Payload,
        subscriber: Box<dyn Subscriber>,
    },
    RequestResponse {
        payload: Payload,
        subscriber: Box<dyn Subscriber>,
    },
    RequestStream {
        payload: Payload,
        initial_request_n: u32,
        subscriber: Box<dyn Subscriber>,
    },
    RequestChannel {
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
        subscriber: Box<dyn ChannelSubscriber>,
    },
}

impl OpenRequest {
    /// Fails the request without it ever reaching the wire.
    pub fn reject(self, error: RSocketError) {
        match self {
            OpenRequest::FireAndForget { mut subscriber, .. }
            | OpenRequest::RequestResponse { mut subscriber, .. }
            | OpenRequest::RequestStream { mut subscriber, .. } => subscriber.on_error(error),
            OpenRequest::RequestChannel { mut subscriber, .. } => {
                subscriber.cancel();
                subscriber.on_error(error);
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpenRequest::FireAndForget { .. } => "fire_and_forget",
            OpenRequest::RequestResponse { .. } => "request_response",
            OpenRequest::RequestStream { .. } => "request_stream",
            OpenRequest::RequestChannel { .. } => "request_channel",
        }
    }
}

impl fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRequest")
            .field("kind", &self.name())
            .finish_non_exhaustive()
    }
}

/// Entry on a connection's signal queue.
#[derive(Debug)]
pub enum Signal {
    Open { key: StreamKey, request: OpenRequest },
    Stream { key: StreamKey, signal: StreamSignal },
    MetadataPush(Bytes),
}

/// Handle to one stream.
///
/// On a requester it grants demand and cancels; on a responder it emits
/// the response items. A channel uses both halves. Signals that make no
/// sense for the stream's interaction model are dropped by the state
/// machine.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    key: StreamKey,
    signals: mpsc::UnboundedSender<Signal>,
}

impl StreamHandle {
    pub(crate) fn new(key: StreamKey, signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self { key, signals }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Returns true once the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }

    fn send(&self, signal: StreamSignal) {
        if self
            .signals
            .send(Signal::Stream {
                key: self.key,
                signal,
            })
            .is_err()
        {
            debug!(key = %self.key, "connection closed, dropping signal");
        }
    }

    pub fn next(&self, payload: Payload, is_complete: bool) {
        self.send(StreamSignal::Next {
            payload,
            complete: is_complete,
        });
    }

    pub fn complete(&self) {
        self.send(StreamSignal::Complete);
    }

    pub fn error(&self, error: RSocketError) {
        self.send(StreamSignal::Error(error));
    }

    pub fn extension(&self, extended_type: u32, content: Bytes, can_be_ignored: bool) {
        self.send(StreamSignal::Extension {
            extended_type,
            content,
            can_be_ignored,
        });
    }

    pub fn request(&self, n: u32) {
        self.send(StreamSignal::Request(n));
    }

    pub fn cancel(&self) {
        self.send(StreamSignal::Cancel);
    }
}

impl ExtensionReceiver for StreamHandle {
    fn on_extension(&mut self, extended_type: u32, content: Bytes, can_be_ignored: bool) {
        self.extension(extended_type, content, can_be_ignored);
    }
}

/// Forwarding a handle as a subscriber pipes items straight back out,
/// which is all an echo responder needs.
impl Subscriber for StreamHandle {
    fn on_next(&mut self, payload: Payload, is_complete: bool) {
        self.next(payload, is_complete);
    }

    fn on_complete(&mut self) {
        self.complete();
    }

    fn on_error(&mut self, error: RSocketError) {
        self.error(error);
    }
}

impl Subscription for StreamHandle {
    fn request(&mut self, n: u32) {
        StreamHandle::request(self, n);
    }

    fn cancel(&mut self) {
        StreamHandle::cancel(self);
    }
}

/// Opens locally-initiated streams on a connection.
#[derive(Debug, Clone)]
pub struct Requester {
    keys: KeyAllocator,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Requester {
    pub(crate) fn new(keys: KeyAllocator, signals: mpsc::UnboundedSender<Signal>) -> Self {
        Self { keys, signals }
    }

    fn open(&self, request: OpenRequest) -> StreamHandle {
        let key = self.keys.next();
        if let Err(mpsc::error::SendError(signal)) =
            self.signals.send(Signal::Open { key, request })
        {
            if let Signal::Open { request, .. } = signal {
                request.reject(RSocketError::connection_close("connection closed"));
            }
        }
        StreamHandle::new(key, self.signals.clone())
    }

    pub fn fire_and_forget(&self, payload: Payload, subscriber: Box<dyn Subscriber>) -> StreamHandle {
        self.open(OpenRequest::FireAndForget {
            payload,
            subscriber,
        })
    }

    pub fn request_response(&self, payload: Payload, subscriber: Box<dyn Subscriber>) -> StreamHandle {
        self.open(OpenRequest::RequestResponse {
            payload,
            subscriber,
        })
    }

    pub fn request_stream(
        &self,
        payload: Payload,
        initial_request_n: u32,
        subscriber: Box<dyn Subscriber>,
    ) -> StreamHandle {
        self.open(OpenRequest::RequestStream {
            payload,
            initial_request_n,
            subscriber,
        })
    }

    pub fn request_channel(
        &self,
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
        subscriber: Box<dyn ChannelSubscriber>,
    ) -> StreamHandle {
        self.open(OpenRequest::RequestChannel {
            payload,
            initial_request_n,
            is_complete,
            subscriber,
        })
    }

    pub fn metadata_push(&self, metadata: Bytes) {
        if self.signals.send(Signal::MetadataPush(metadata)).is_err() {
            debug!("connection closed, dropping metadata push");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Event, Recorder};
    use rsocket_protocol::ErrorCode;

    #[test]
    fn test_keys_are_unique() {
        let keys = KeyAllocator::default();
        let a = keys.next();
        let b = keys.clone().next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_handle_enqueues_signals_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = StreamHandle::new(StreamKey::from_raw(7), tx);
        handle.request(3);
        handle.next(Payload::from_data("a"), false);
        handle.cancel();

        let signals: Vec<StreamSignal> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| match s {
                Signal::Stream { key, signal } => {
                    assert_eq!(key.as_raw(), 7);
                    signal
                }
                other => panic!("unexpected signal: {other:?}"),
            })
            .collect();
        assert_eq!(
            signals,
            vec![
                StreamSignal::Request(3),
                StreamSignal::Next {
                    payload: Payload::from_data("a"),
                    complete: false
                },
                StreamSignal::Cancel,
            ]
        );
    }

    #[test]
    fn test_open_on_closed_connection_rejects() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let requester = Requester::new(KeyAllocator::default(), tx);
        assert!(requester.is_closed());

        let (recorder, events) = Recorder::new();
        requester.request_response(Payload::from_data("ping"), Box::new(recorder));

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Event::Error(RSocketError {
                code: ErrorCode::ConnectionClose,
                ..
            })
        ));
    }
}
