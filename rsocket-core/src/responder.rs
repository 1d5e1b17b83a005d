//! Application entry point for peer-initiated requests.

use crate::error::RSocketError;
use crate::signal::StreamHandle;
use crate::subscriber::{ChannelSubscriber, NoopChannelSubscriber, NoopSubscription, Subscription};
use bytes::Bytes;
use rsocket_protocol::Payload;
use tracing::debug;

/// Handles requests opened by the peer.
///
/// Each method is invoked once per stream, after the request payload has
/// been fully reassembled. Responses go out through the `sender` handle;
/// the returned value receives the peer's demand, cancellation and (for a
/// channel) inbound items. Every default rejects the request.
pub trait Responder: Send + Sync {
    fn fire_and_forget(&self, _payload: Payload) {
        debug!("fire_and_forget not implemented, dropping request");
    }

    fn request_response(&self, _payload: Payload, sender: StreamHandle) -> Box<dyn Subscription> {
        sender.error(not_implemented("request_response"));
        Box::new(NoopSubscription)
    }

    fn request_stream(
        &self,
        _payload: Payload,
        _initial_request_n: u32,
        sender: StreamHandle,
    ) -> Box<dyn Subscription> {
        sender.error(not_implemented("request_stream"));
        Box::new(NoopSubscription)
    }

    fn request_channel(
        &self,
        _payload: Payload,
        _initial_request_n: u32,
        _is_complete: bool,
        sender: StreamHandle,
    ) -> Box<dyn ChannelSubscriber> {
        sender.error(not_implemented("request_channel"));
        Box::new(NoopChannelSubscriber)
    }

    fn metadata_push(&self, _metadata: Bytes) {}
}

fn not_implemented(interaction: &str) -> RSocketError {
    RSocketError::application(format!("{interaction} not implemented"))
}

/// Responder that rejects everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl Responder for RejectAll {}
