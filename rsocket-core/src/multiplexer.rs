//! Stream registry and frame dispatch for one connection.
//!
//! The multiplexer owns every stream state machine of a connection. It is
//! sans-I/O: inbound frames go in through [`Multiplexer::dispatch`], local
//! signals through [`Multiplexer::apply`], and outbound frames are collected
//! with [`Multiplexer::take_outbound`]. All three must be driven from one
//! task.

use crate::error::RSocketError;
use crate::lease::{IssuedLease, LeaseDecision, LeaseManager, LeasePolicy};
use crate::responder::Responder;
use crate::signal::{KeyAllocator, OpenRequest, Requester, Signal, StreamHandle, StreamKey};
use crate::stream::{
    FireAndForgetRequester, FireAndForgetResponder, RequestChannelRequester,
    RequestChannelResponder, RequestResponseRequester, RequestResponseResponder,
    RequestStreamRequester, RequestStreamResponder, StreamContext, StreamHandler,
};
use bytes::Bytes;
use rsocket_protocol::{ErrorCode, Frame, FrameBody, FrameType, MAX_FRAME_LENGTH, MAX_STREAM_ID};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Which end of the connection this multiplexer serves. Clients allocate
/// odd stream IDs, servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub role: Role,
    /// Maximum outbound frame size. 0 fragments only what the 24-bit frame
    /// length could not carry.
    pub fragment_size: usize,
    /// Lease policy, when lease was negotiated at setup.
    pub lease: Option<LeasePolicy>,
}

impl MultiplexerConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            fragment_size: 0,
            lease: None,
        }
    }

    pub fn with_fragment_size(mut self, fragment_size: usize) -> Self {
        self.fragment_size = fragment_size;
        self
    }

    pub fn with_lease(mut self, policy: LeasePolicy) -> Self {
        self.lease = Some(policy);
        self
    }

    /// Frame size outbound payloads are fragmented against, never above
    /// [`MAX_FRAME_LENGTH`].
    pub fn max_frame_size(&self) -> usize {
        match self.fragment_size {
            0 => MAX_FRAME_LENGTH,
            n => n.min(MAX_FRAME_LENGTH),
        }
    }
}

/// Routes frames and signals to the streams of one connection.
pub struct Multiplexer {
    config: MultiplexerConfig,
    responder: Arc<dyn Responder>,
    streams: HashMap<StreamKey, Box<dyn StreamHandler>>,
    stream_ids: HashMap<u32, StreamKey>,
    /// Stream IDs of rejected requests whose trailing fragments are still due.
    rejected_fragments: HashSet<u32>,
    next_stream_id: u32,
    lease: Option<LeaseManager>,
    issued_lease: IssuedLease,
    outbound: VecDeque<Frame>,
    keys: KeyAllocator,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    closed: Option<RSocketError>,
}

impl Multiplexer {
    pub fn new(config: MultiplexerConfig, responder: Arc<dyn Responder>) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            next_stream_id: config.role.first_stream_id(),
            lease: config.lease.map(LeaseManager::new),
            config,
            responder,
            streams: HashMap::new(),
            stream_ids: HashMap::new(),
            rejected_fragments: HashSet::new(),
            issued_lease: IssuedLease::default(),
            outbound: VecDeque::new(),
            keys: KeyAllocator::default(),
            signals_tx,
            signals_rx,
            closed: None,
        }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Returns a handle for opening streams on this connection.
    pub fn requester(&self) -> Requester {
        Requester::new(self.keys.clone(), self.signals_tx.clone())
    }

    /// Number of streams in the registry, including requesters still
    /// waiting for lease budget.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if `stream_id` maps to a live stream.
    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.stream_ids.contains_key(&stream_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// The error the connection was closed with, if any.
    pub fn close_reason(&self) -> Option<&RSocketError> {
        self.closed.as_ref()
    }

    /// Requests that may still be initiated under the peer's lease.
    /// `None` when lease is not in use.
    pub fn available_requests(&self) -> Option<u32> {
        self.lease
            .as_ref()
            .map(|lease| lease.available_requests(Instant::now()))
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Removes and returns every frame queued for the peer, in order.
    pub fn take_outbound(&mut self) -> Vec<Frame> {
        self.outbound.drain(..).collect()
    }

    /// Waits for the next local signal.
    pub async fn recv_signal(&mut self) -> Option<Signal> {
        self.signals_rx.recv().await
    }

    /// Applies every signal already queued. Returns how many were applied.
    pub fn poll_signals(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(signal) = self.signals_rx.try_recv() {
            self.apply(signal);
            applied += 1;
        }
        applied
    }

    /// Routes one inbound frame.
    pub fn dispatch(&mut self, frame: Frame) {
        if self.closed.is_some() {
            debug!(stream_id = frame.stream_id, "connection closed, dropping inbound frame");
            return;
        }
        trace!(
            stream_id = frame.stream_id,
            frame_type = %frame.frame_type(),
            flags = frame.flags.bits(),
            "dispatch frame"
        );

        let stream_id = frame.stream_id;
        if stream_id == 0 {
            self.handle_connection_frame(frame);
            return;
        }

        let Some(&key) = self.stream_ids.get(&stream_id) else {
            self.handle_unknown_stream(frame);
            return;
        };

        if frame.frame_type().is_request() {
            warn!(stream_id, "request frame for a stream already in use");
            let error = RSocketError::invalid(format!("stream {stream_id} already in use"));
            self.outbound.push_back(error.to_frame(stream_id));
            if let Some(mut handler) = self.release(key) {
                handler.close(Some(error));
            }
            return;
        }

        self.with_stream(key, |handler, ctx| handler.handle_frame(frame, ctx));
    }

    /// Applies one local signal.
    pub fn apply(&mut self, signal: Signal) {
        match signal {
            Signal::Open { key, request } => self.open(key, request),
            Signal::Stream { key, signal } => {
                if !self.streams.contains_key(&key) {
                    debug!(key = %key, signal = ?signal, "signal for released stream dropped");
                    return;
                }
                self.with_stream(key, |handler, ctx| handler.handle_signal(signal, ctx));
            }
            Signal::MetadataPush(metadata) => {
                if self.closed.is_some() {
                    debug!("connection closed, dropping metadata push");
                    return;
                }
                self.outbound.push_back(Frame::metadata_push(metadata));
            }
        }
    }

    /// Grants the peer `request_count` requests for the next `ttl_ms`
    /// milliseconds.
    pub fn grant_lease(&mut self, request_count: u32, ttl_ms: u32, metadata: Option<Bytes>) {
        if self.lease.is_none() {
            warn!("lease was not negotiated, ignoring grant");
            return;
        }
        if self.closed.is_some() {
            return;
        }
        self.issued_lease.grant(request_count, ttl_ms, Instant::now());
        self.outbound
            .push_back(Frame::lease(ttl_ms, request_count, metadata));
    }

    /// Terminates every stream with `error`. Each stream delivers at most
    /// one terminal callback; no frames are sent.
    pub fn close(&mut self, error: RSocketError) {
        if self.closed.is_some() {
            return;
        }
        info!(%error, streams = self.streams.len(), "closing connection");
        self.closed = Some(error.clone());
        if let Some(lease) = self.lease.as_mut() {
            lease.drain_pending();
        }
        self.stream_ids.clear();
        self.rejected_fragments.clear();

        let mut streams: Vec<_> = self.streams.drain().collect();
        streams.sort_by_key(|(key, _)| *key);
        for (_, mut handler) in streams {
            handler.close(Some(error.clone()));
        }
    }

    fn with_stream<F>(&mut self, key: StreamKey, f: F)
    where
        F: FnOnce(&mut dyn StreamHandler, &mut StreamContext<'_>),
    {
        let Some(handler) = self.streams.get_mut(&key) else {
            return;
        };
        let mut ctx = StreamContext::new(&mut self.outbound, self.config.max_frame_size());
        f(handler.as_mut(), &mut ctx);
        self.sweep(key);
    }

    /// Releases the stream if both of its directions are done.
    fn sweep(&mut self, key: StreamKey) {
        let terminated = self
            .streams
            .get(&key)
            .is_some_and(|handler| handler.is_terminated());
        if terminated {
            self.release(key);
        }
    }

    fn release(&mut self, key: StreamKey) -> Option<Box<dyn StreamHandler>> {
        let handler = self.streams.remove(&key)?;
        match handler.stream_id() {
            Some(stream_id) => {
                if self.stream_ids.get(&stream_id) == Some(&key) {
                    self.stream_ids.remove(&stream_id);
                }
            }
            None => {
                if let Some(lease) = self.lease.as_mut() {
                    lease.cancel_request(key);
                }
            }
        }
        debug!(
            key = %key,
            stream_id = ?handler.stream_id(),
            kind = handler.kind(),
            "stream released"
        );
        Some(handler)
    }

    fn allocate_stream_id(&mut self) -> Option<u32> {
        let start = self.next_stream_id;
        loop {
            let stream_id = self.next_stream_id;
            self.next_stream_id = if stream_id > MAX_STREAM_ID - 2 {
                self.config.role.first_stream_id()
            } else {
                stream_id + 2
            };
            if !self.stream_ids.contains_key(&stream_id) {
                return Some(stream_id);
            }
            if self.next_stream_id == start {
                return None;
            }
        }
    }

    fn is_peer_stream_id(&self, stream_id: u32) -> bool {
        match self.config.role {
            Role::Client => stream_id % 2 == 0,
            Role::Server => stream_id % 2 == 1,
        }
    }

    fn open(&mut self, key: StreamKey, request: OpenRequest) {
        if let Some(error) = &self.closed {
            debug!(key = %key, kind = request.name(), "connection closed, rejecting request");
            request.reject(error.clone());
            return;
        }

        let handler: Box<dyn StreamHandler> = match request {
            OpenRequest::FireAndForget {
                payload,
                subscriber,
            } => Box::new(FireAndForgetRequester::new(payload, subscriber)),
            OpenRequest::RequestResponse {
                payload,
                subscriber,
            } => Box::new(RequestResponseRequester::new(payload, subscriber)),
            OpenRequest::RequestStream {
                payload,
                initial_request_n,
                subscriber,
            } => Box::new(RequestStreamRequester::new(
                payload,
                initial_request_n,
                subscriber,
            )),
            OpenRequest::RequestChannel {
                payload,
                initial_request_n,
                is_complete,
                subscriber,
            } => Box::new(RequestChannelRequester::new(
                payload,
                initial_request_n,
                is_complete,
                subscriber,
            )),
        };
        self.streams.insert(key, handler);

        let decision = match self.lease.as_mut() {
            None => LeaseDecision::Granted,
            Some(lease) => lease.request(key, Instant::now()),
        };
        match decision {
            LeaseDecision::Granted => self.activate(key),
            LeaseDecision::Queued => debug!(key = %key, "request queued awaiting lease"),
            LeaseDecision::Rejected(error) => {
                debug!(key = %key, %error, "request rejected by lease");
                if let Some(mut handler) = self.streams.remove(&key) {
                    handler.close(Some(error));
                }
            }
        }
    }

    /// Assigns a stream ID and lets the requester send its first frame.
    fn activate(&mut self, key: StreamKey) {
        if !self.streams.contains_key(&key) {
            return;
        }
        let Some(stream_id) = self.allocate_stream_id() else {
            warn!(key = %key, "no stream id available");
            if let Some(mut handler) = self.release(key) {
                handler.close(Some(RSocketError::rejected("stream ids exhausted")));
            }
            return;
        };
        let Some(handler) = self.streams.get_mut(&key) else {
            return;
        };
        let mut ctx = StreamContext::new(&mut self.outbound, self.config.max_frame_size());
        if handler.handle_ready(stream_id, &mut ctx) {
            self.stream_ids.insert(stream_id, key);
            debug!(stream_id, kind = handler.kind(), "stream opened");
        }
        self.sweep(key);
    }

    fn handle_unknown_stream(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.frame_type() {
            FrameType::RequestFnf
            | FrameType::RequestResponse
            | FrameType::RequestStream
            | FrameType::RequestChannel => self.accept(frame),
            FrameType::Cancel | FrameType::Error => {
                debug!(stream_id, frame_type = %frame.frame_type(), "ignoring frame for unknown stream");
            }
            FrameType::Payload if self.rejected_fragments.contains(&stream_id) => {
                trace!(stream_id, "dropping fragment of a rejected request");
                if !frame.flags.has_follows() {
                    self.rejected_fragments.remove(&stream_id);
                }
            }
            FrameType::Payload | FrameType::RequestN | FrameType::Ext => {
                warn!(stream_id, frame_type = %frame.frame_type(), "frame for unknown stream");
                self.outbound.push_back(Frame::error(
                    stream_id,
                    ErrorCode::Invalid,
                    format!("unknown stream {stream_id}"),
                ));
            }
            FrameType::Setup | FrameType::Lease | FrameType::Keepalive | FrameType::MetadataPush => {
                warn!(stream_id, frame_type = %frame.frame_type(), "connection frame on a stream, ignoring");
            }
        }
    }

    /// Creates the responder for a peer-initiated request.
    fn accept(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        if !self.is_peer_stream_id(stream_id) {
            warn!(stream_id, "peer used a locally-owned stream id");
            self.reject(
                &frame,
                ErrorCode::Invalid,
                format!("stream id {stream_id} is not a valid peer stream id"),
            );
            return;
        }
        if self.lease.is_some() && !self.issued_lease.try_acquire(Instant::now()) {
            debug!(stream_id, "rejecting request, lease exhausted");
            self.reject(&frame, ErrorCode::Rejected, "lease exhausted");
            return;
        }

        let key = self.keys.next();
        let sender = StreamHandle::new(key, self.signals_tx.clone());
        let responder = self.responder.clone();
        let flags = frame.flags;
        let handler: Box<dyn StreamHandler> = match frame.body {
            FrameBody::RequestFnf(payload) if !flags.has_follows() => {
                self.responder.fire_and_forget(payload);
                return;
            }
            FrameBody::RequestFnf(payload) => {
                Box::new(FireAndForgetResponder::new(stream_id, responder, payload))
            }
            FrameBody::RequestResponse(payload) => Box::new(RequestResponseResponder::new(
                stream_id, flags, payload, responder, sender,
            )),
            FrameBody::RequestStream {
                initial_request_n,
                payload,
            } => Box::new(RequestStreamResponder::new(
                stream_id,
                flags,
                initial_request_n,
                payload,
                responder,
                sender,
            )),
            FrameBody::RequestChannel {
                initial_request_n,
                payload,
            } => Box::new(RequestChannelResponder::new(
                stream_id,
                flags,
                initial_request_n,
                payload,
                responder,
                sender,
            )),
            _ => return,
        };

        debug!(stream_id, kind = handler.kind(), "stream accepted");
        self.streams.insert(key, handler);
        self.stream_ids.insert(stream_id, key);
        self.sweep(key);
    }

    /// Answers a request with one ERROR. Later fragments of the same
    /// request are dropped silently.
    fn reject(&mut self, frame: &Frame, code: ErrorCode, message: impl Into<String>) {
        if frame.flags.has_follows() {
            self.rejected_fragments.insert(frame.stream_id);
        }
        self.outbound.push_back(Frame::error(frame.stream_id, code, message));
    }

    fn handle_connection_frame(&mut self, frame: Frame) {
        let flags = frame.flags;
        let frame_type = frame.frame_type();
        match frame.body {
            FrameBody::Keepalive { data, .. } => {
                if flags.has_respond() {
                    self.outbound.push_back(Frame::keepalive(0, data, false));
                }
            }
            FrameBody::Lease {
                ttl_ms,
                request_count,
                ..
            } => self.on_lease(request_count, ttl_ms),
            FrameBody::MetadataPush { metadata } => self.responder.metadata_push(metadata),
            FrameBody::Error { code, message } => {
                let error = RSocketError::new(code, message);
                info!(%error, "peer closed the connection");
                self.close(error);
            }
            FrameBody::Ext { extended_type, .. } if flags.has_ignore() => {
                debug!(extended_type, "ignoring connection-level extension");
            }
            _ => {
                warn!(%frame_type, "unexpected frame on stream 0");
                let error =
                    RSocketError::connection_error(format!("unexpected frame {frame_type} on stream 0"));
                self.outbound.push_back(error.to_frame(0));
                self.close(error);
            }
        }
    }

    fn on_lease(&mut self, request_count: u32, ttl_ms: u32) {
        let Some(lease) = self.lease.as_mut() else {
            warn!("LEASE received but lease was not negotiated");
            return;
        };
        let admitted = lease.on_lease(request_count, ttl_ms, Instant::now());
        for key in admitted {
            self.activate(key);
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.config.role)
            .field("streams", &self.streams.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
