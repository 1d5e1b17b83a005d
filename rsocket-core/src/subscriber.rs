//! Receivers the engine calls into.
//!
//! All callbacks run on the connection's thread of control while a frame or
//! signal is being processed. They must not block; long-running work should
//! be handed off and its results sent back through a [`StreamHandle`].
//!
//! [`StreamHandle`]: crate::signal::StreamHandle

use crate::error::RSocketError;
use bytes::Bytes;
use rsocket_protocol::Payload;

/// Receives EXT frames addressed to a stream.
pub trait ExtensionReceiver {
    fn on_extension(&mut self, _extended_type: u32, _content: Bytes, _can_be_ignored: bool) {}
}

/// Consumer side of a stream: receives payloads and exactly one terminal
/// signal.
pub trait Subscriber: ExtensionReceiver + Send {
    /// Delivers one item. `is_complete` marks the final item.
    fn on_next(&mut self, payload: Payload, is_complete: bool);

    fn on_complete(&mut self);

    fn on_error(&mut self, error: RSocketError);
}

/// Producer-side control: demand and cancellation coming from the peer.
pub trait Subscription: ExtensionReceiver + Send {
    fn request(&mut self, _n: u32) {}

    fn cancel(&mut self);
}

/// Receiver of a request-channel: consumes inbound items and reacts to the
/// peer's demand for outbound ones.
pub trait ChannelSubscriber: Subscriber + Subscription {}

impl<T: Subscriber + Subscription> ChannelSubscriber for T {}

/// Subscription with nothing to cancel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl ExtensionReceiver for NoopSubscription {}

impl Subscription for NoopSubscription {
    fn cancel(&mut self) {}
}

/// Channel receiver that discards inbound items.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChannelSubscriber;

impl ExtensionReceiver for NoopChannelSubscriber {}

impl Subscriber for NoopChannelSubscriber {
    fn on_next(&mut self, _payload: Payload, _is_complete: bool) {}
    fn on_complete(&mut self) {}
    fn on_error(&mut self, _error: RSocketError) {}
}

impl Subscription for NoopChannelSubscriber {
    fn cancel(&mut self) {}
}
