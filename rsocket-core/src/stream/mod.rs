//! Interaction-model state machines.
//!
//! Every stream tracks two completion flags, one per direction. The
//! multiplexer releases a stream's registry entry as soon as
//! [`StreamHandler::is_terminated`] reports both directions done.

mod fire_and_forget;
mod request_channel;
mod request_response;
mod request_stream;

pub(crate) use fire_and_forget::{FireAndForgetRequester, FireAndForgetResponder};
pub(crate) use request_channel::{RequestChannelRequester, RequestChannelResponder};
pub(crate) use request_response::{RequestResponseRequester, RequestResponseResponder};
pub(crate) use request_stream::{RequestStreamRequester, RequestStreamResponder};

use crate::error::RSocketError;
use crate::fragmenter::{fragment, fragment_with_request_n, is_fragmentable};
use crate::signal::StreamSignal;
use bytes::Bytes;
use rsocket_protocol::{Flags, Frame, FrameType, Payload, MAX_REQUEST_N};
use std::collections::VecDeque;
use tracing::trace;

/// Outbound side of the connection as seen by one stream.
pub(crate) struct StreamContext<'a> {
    frames: &'a mut VecDeque<Frame>,
    fragment_size: usize,
}

impl<'a> StreamContext<'a> {
    pub(crate) fn new(frames: &'a mut VecDeque<Frame>, fragment_size: usize) -> Self {
        Self {
            frames,
            fragment_size,
        }
    }

    pub(crate) fn send(&mut self, frame: Frame) {
        trace!(
            stream_id = frame.stream_id,
            frame_type = %frame.frame_type(),
            flags = frame.flags.bits(),
            "queue frame"
        );
        self.frames.push_back(frame);
    }

    /// Sends a request-initiating frame, fragmenting it when it is too large.
    pub(crate) fn send_request(
        &mut self,
        stream_id: u32,
        frame_type: FrameType,
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
    ) {
        if is_fragmentable(&payload, self.fragment_size, frame_type) {
            let fragments = fragment_with_request_n(
                stream_id,
                payload,
                self.fragment_size,
                frame_type,
                initial_request_n,
                is_complete,
            );
            for frame in fragments {
                self.send(frame);
            }
        } else {
            let flags = Flags::NONE.with_if(Flags::COMPLETE, is_complete);
            self.send(Frame::request(
                frame_type,
                stream_id,
                payload,
                initial_request_n,
                flags,
            ));
        }
    }

    /// Sends one NEXT item, fragmenting it when it is too large.
    pub(crate) fn send_next(&mut self, stream_id: u32, payload: Payload, is_complete: bool) {
        if is_fragmentable(&payload, self.fragment_size, FrameType::Payload) {
            let fragments = fragment(
                stream_id,
                payload,
                self.fragment_size,
                FrameType::Payload,
                is_complete,
            );
            for frame in fragments {
                self.send(frame);
            }
        } else {
            let flags = Flags::NEXT.with_if(Flags::COMPLETE, is_complete);
            self.send(Frame::payload(stream_id, payload, flags));
        }
    }

    pub(crate) fn send_complete(&mut self, stream_id: u32) {
        self.send(Frame::complete(stream_id));
    }

    pub(crate) fn send_error(&mut self, stream_id: u32, error: &RSocketError) {
        self.send(error.to_frame(stream_id));
    }

    pub(crate) fn send_cancel(&mut self, stream_id: u32) {
        self.send(Frame::cancel(stream_id));
    }

    pub(crate) fn send_request_n(&mut self, stream_id: u32, n: u32) {
        self.send(Frame::request_n(stream_id, n));
    }

    pub(crate) fn send_extension(&mut self, stream_id: u32, extension: PendingExtension) {
        self.send(Frame::ext(
            stream_id,
            extension.extended_type,
            extension.content,
            extension.can_be_ignored,
        ));
    }
}

/// One interaction-model state machine, requester or responder side.
pub(crate) trait StreamHandler: Send {
    fn stream_id(&self) -> Option<u32>;

    /// Name of the interaction model, for logging.
    fn kind(&self) -> &'static str;

    /// Assigns a stream ID to a pending requester and sends the initiating
    /// frame. Returns false if the requester was cancelled meanwhile.
    fn handle_ready(&mut self, _stream_id: u32, _ctx: &mut StreamContext<'_>) -> bool {
        false
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut StreamContext<'_>);

    fn handle_signal(&mut self, signal: StreamSignal, ctx: &mut StreamContext<'_>);

    /// Terminates the stream without any frame exchange. `None` means a
    /// clean shutdown.
    fn close(&mut self, error: Option<RSocketError>);

    /// True once both directions are done.
    fn is_terminated(&self) -> bool;
}

/// Lifecycle of a locally-initiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Waiting for a stream ID. Holds the demand accumulated so far.
    Pending { initial_request_n: u32 },
    Active { stream_id: u32 },
}

impl Phase {
    pub(crate) fn stream_id(&self) -> Option<u32> {
        match self {
            Phase::Pending { .. } => None,
            Phase::Active { stream_id } => Some(*stream_id),
        }
    }
}

/// EXT frame content waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingExtension {
    pub(crate) extended_type: u32,
    pub(crate) content: Bytes,
    pub(crate) can_be_ignored: bool,
}

/// Adds demand, treating anything at or above `MAX_REQUEST_N` as unbounded.
pub(crate) fn add_demand(current: u32, n: u32) -> u32 {
    current.saturating_add(n).min(MAX_REQUEST_N)
}

/// Credit-gated buffer for the outbound items of a stream.
#[derive(Debug)]
pub(crate) struct OutboundFlow {
    credit: u32,
    queue: VecDeque<Payload>,
    completing: bool,
}

impl OutboundFlow {
    pub(crate) fn new(initial_credit: u32) -> Self {
        Self {
            credit: initial_credit.min(MAX_REQUEST_N),
            queue: VecDeque::new(),
            completing: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn credit(&self) -> u32 {
        self.credit
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_unbounded(&self) -> bool {
        self.credit == MAX_REQUEST_N
    }

    /// Adds demand granted by the peer.
    pub(crate) fn grant(&mut self, n: u32) {
        self.credit = add_demand(self.credit, n);
    }

    /// Queues an item. Call [`drain`](Self::drain) to release what credit
    /// allows.
    pub(crate) fn push(&mut self, payload: Payload, complete: bool) {
        self.queue.push_back(payload);
        if complete {
            self.completing = true;
        }
    }

    /// Requests completion. Returns true if a bare COMPLETE can go out now;
    /// otherwise completion rides on the last queued item.
    pub(crate) fn complete(&mut self) -> bool {
        if self.queue.is_empty() {
            true
        } else {
            self.completing = true;
            false
        }
    }

    /// True once completion was requested, even if items are still queued.
    pub(crate) fn is_completing(&self) -> bool {
        self.completing
    }

    /// True once completion was requested and every item has been released.
    pub(crate) fn is_finished(&self) -> bool {
        self.completing && self.queue.is_empty()
    }

    /// Releases as many items as credit allows, each paired with whether it
    /// carries COMPLETE.
    pub(crate) fn drain(&mut self) -> Vec<(Payload, bool)> {
        let mut ready = Vec::new();
        while self.credit > 0 {
            let Some(payload) = self.queue.pop_front() else {
                break;
            };
            if !self.is_unbounded() {
                self.credit -= 1;
            }
            let last = self.completing && self.queue.is_empty();
            ready.push((payload, last));
        }
        ready
    }

    /// Drops queued items and any pending completion.
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.completing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flow_holds_items_beyond_credit() {
        let mut flow = OutboundFlow::new(2);
        flow.push(Payload::from_data("1"), false);
        flow.push(Payload::from_data("2"), false);
        flow.push(Payload::from_data("3"), true);

        let ready = flow.drain();
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|(_, complete)| !complete));
        assert_eq!(flow.credit(), 0);
        assert_eq!(flow.queued(), 1);
        assert!(!flow.is_finished());

        flow.grant(1);
        let ready = flow.drain();
        assert_eq!(ready, vec![(Payload::from_data("3"), true)]);
        assert!(flow.is_finished());
    }

    #[test]
    fn test_flow_deferred_complete_fuses_onto_last_item() {
        let mut flow = OutboundFlow::new(0);
        flow.push(Payload::from_data("a"), false);
        assert!(!flow.complete());
        assert!(flow.drain().is_empty());

        flow.grant(5);
        assert_eq!(flow.drain(), vec![(Payload::from_data("a"), true)]);
        assert_eq!(flow.credit(), 4);
    }

    #[test]
    fn test_flow_bare_complete_when_idle() {
        let mut flow = OutboundFlow::new(1);
        assert!(flow.complete());
    }

    #[test]
    fn test_flow_unbounded_credit_never_decrements() {
        let mut flow = OutboundFlow::new(MAX_REQUEST_N);
        assert!(flow.is_unbounded());
        for i in 0..10 {
            flow.push(Payload::from_data(format!("{i}")), false);
        }
        assert_eq!(flow.drain().len(), 10);
        assert!(flow.is_unbounded());
    }

    #[test]
    fn test_demand_saturates() {
        assert_eq!(add_demand(1, 2), 3);
        assert_eq!(add_demand(MAX_REQUEST_N - 1, 5), MAX_REQUEST_N);
        assert_eq!(add_demand(u32::MAX, u32::MAX), MAX_REQUEST_N);

        let mut flow = OutboundFlow::new(10);
        flow.grant(u32::MAX);
        assert!(flow.is_unbounded());
    }

    #[test]
    fn test_flow_clear() {
        let mut flow = OutboundFlow::new(0);
        flow.push(Payload::from_data("x"), true);
        flow.clear();
        assert_eq!(flow.queued(), 0);
        assert!(!flow.is_finished());
    }

    proptest! {
        #[test]
        fn prop_flow_never_exceeds_granted_demand(
            initial in 0u32..8,
            ops in proptest::collection::vec((any::<bool>(), 0u32..8), 1..128)
        ) {
            let mut flow = OutboundFlow::new(initial);
            let mut granted = u64::from(initial);
            let mut pushed = 0u64;
            let mut emitted = 0u64;
            for (is_grant, n) in ops {
                if is_grant {
                    flow.grant(n);
                    granted += u64::from(n);
                } else {
                    flow.push(Payload::from_data(pushed.to_string()), false);
                    pushed += 1;
                }
                for (payload, _) in flow.drain() {
                    let expected = emitted.to_string();
                    prop_assert_eq!(payload.data_utf8(), Some(expected.as_str()));
                    emitted += 1;
                }
                prop_assert!(emitted <= granted);
                prop_assert_eq!(emitted, pushed.min(granted));
            }
        }
    }
}
