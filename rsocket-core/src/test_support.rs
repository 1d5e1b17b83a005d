//! Recording receivers and responders shared by the unit tests.

use crate::error::RSocketError;
use crate::responder::Responder;
use crate::signal::StreamHandle;
use crate::stream::StreamContext;
use crate::subscriber::{ChannelSubscriber, ExtensionReceiver, Subscriber, Subscription};
use bytes::Bytes;
use rsocket_protocol::{Frame, Payload};
use std::collections::VecDeque;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Next(Payload, bool),
    Complete,
    Error(RSocketError),
    Extension(u32, Bytes),
    Request(u32),
    Cancel,
}

impl Event {
    pub(crate) fn next(data: &'static str, complete: bool) -> Self {
        Event::Next(Payload::from_data(data), complete)
    }
}

pub(crate) type Events = Arc<Mutex<Vec<Event>>>;

/// Records every callback it receives.
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    events: Events,
}

impl Recorder {
    pub(crate) fn new() -> (Self, Events) {
        let recorder = Self::default();
        let events = recorder.events.clone();
        (recorder, events)
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl ExtensionReceiver for Recorder {
    fn on_extension(&mut self, extended_type: u32, content: Bytes, _can_be_ignored: bool) {
        self.push(Event::Extension(extended_type, content));
    }
}

impl Subscriber for Recorder {
    fn on_next(&mut self, payload: Payload, is_complete: bool) {
        self.push(Event::Next(payload, is_complete));
    }

    fn on_complete(&mut self) {
        self.push(Event::Complete);
    }

    fn on_error(&mut self, error: RSocketError) {
        self.push(Event::Error(error));
    }
}

impl Subscription for Recorder {
    fn request(&mut self, n: u32) {
        self.push(Event::Request(n));
    }

    fn cancel(&mut self) {
        self.push(Event::Cancel);
    }
}

/// A request as seen by [`TestResponder`].
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub(crate) kind: &'static str,
    pub(crate) payload: Payload,
    pub(crate) initial_request_n: u32,
    pub(crate) is_complete: bool,
    pub(crate) sender: StreamHandle,
    /// Callbacks delivered to the receiver returned for this request.
    pub(crate) events: Events,
}

/// Responder that records invocations and leaves responding to the test.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestResponder {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    fire_and_forgets: Arc<Mutex<Vec<Payload>>>,
    metadata_pushes: Arc<Mutex<Vec<Bytes>>>,
}

impl TestResponder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    pub(crate) fn fire_and_forgets(&self) -> Vec<Payload> {
        self.fire_and_forgets.lock().clone()
    }

    pub(crate) fn metadata_pushes(&self) -> Vec<Bytes> {
        self.metadata_pushes.lock().clone()
    }

    fn record(
        &self,
        kind: &'static str,
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
        sender: StreamHandle,
    ) -> Recorder {
        let (recorder, events) = Recorder::new();
        self.invocations.lock().push(Invocation {
            kind,
            payload,
            initial_request_n,
            is_complete,
            sender,
            events,
        });
        recorder
    }
}

impl Responder for TestResponder {
    fn fire_and_forget(&self, payload: Payload) {
        self.fire_and_forgets.lock().push(payload);
    }

    fn request_response(&self, payload: Payload, sender: StreamHandle) -> Box<dyn Subscription> {
        Box::new(self.record("request_response", payload, 1, true, sender))
    }

    fn request_stream(
        &self,
        payload: Payload,
        initial_request_n: u32,
        sender: StreamHandle,
    ) -> Box<dyn Subscription> {
        Box::new(self.record("request_stream", payload, initial_request_n, true, sender))
    }

    fn request_channel(
        &self,
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
        sender: StreamHandle,
    ) -> Box<dyn ChannelSubscriber> {
        Box::new(self.record(
            "request_channel",
            payload,
            initial_request_n,
            is_complete,
            sender,
        ))
    }

    fn metadata_push(&self, metadata: Bytes) {
        self.metadata_pushes.lock().push(metadata);
    }
}

/// Outbound frame sink for driving a single state machine. Payloads are
/// never fragmented.
#[derive(Debug, Default)]
pub(crate) struct Wire {
    frames: VecDeque<Frame>,
}

impl Wire {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ctx(&mut self) -> StreamContext<'_> {
        StreamContext::new(&mut self.frames, 0)
    }

    pub(crate) fn take(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }
}

/// A handle whose signals go nowhere; state machine tests apply signals
/// directly.
pub(crate) fn detached_handle() -> StreamHandle {
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    StreamHandle::new(crate::signal::StreamKey::from_raw(0), tx)
}
