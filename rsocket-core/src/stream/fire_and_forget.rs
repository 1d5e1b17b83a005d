//! Fire-and-forget: one request frame, no reply.

use super::{Phase, StreamContext, StreamHandler};
use crate::error::RSocketError;
use crate::reassembler::FragmentsHolder;
use crate::responder::Responder;
use crate::signal::StreamSignal;
use crate::subscriber::Subscriber;
use rsocket_protocol::{Frame, FrameBody, FrameType, Payload};
use std::sync::Arc;
use tracing::debug;

/// Sends a single REQUEST_FNF and reports completion once it is queued.
pub(crate) struct FireAndForgetRequester {
    phase: Phase,
    payload: Option<Payload>,
    receiver: Box<dyn Subscriber>,
    done: bool,
}

impl FireAndForgetRequester {
    pub(crate) fn new(payload: Payload, receiver: Box<dyn Subscriber>) -> Self {
        Self {
            phase: Phase::Pending {
                initial_request_n: 0,
            },
            payload: Some(payload),
            receiver,
            done: false,
        }
    }
}

impl StreamHandler for FireAndForgetRequester {
    fn stream_id(&self) -> Option<u32> {
        self.phase.stream_id()
    }

    fn kind(&self) -> &'static str {
        "fire_and_forget requester"
    }

    fn handle_ready(&mut self, stream_id: u32, ctx: &mut StreamContext<'_>) -> bool {
        if self.done {
            return false;
        }
        self.phase = Phase::Active { stream_id };
        let payload = self.payload.take().unwrap_or_default();
        ctx.send_request(stream_id, FrameType::RequestFnf, payload, 0, false);
        self.done = true;
        self.receiver.on_complete();
        true
    }

    fn handle_frame(&mut self, frame: Frame, _ctx: &mut StreamContext<'_>) {
        debug!(
            stream_id = frame.stream_id,
            frame_type = %frame.frame_type(),
            "ignoring frame on fire_and_forget stream"
        );
    }

    fn handle_signal(&mut self, signal: StreamSignal, _ctx: &mut StreamContext<'_>) {
        match signal {
            // Only reachable while still waiting for lease budget
            StreamSignal::Cancel if !self.done => {
                self.done = true;
                self.payload = None;
            }
            other => debug!(signal = ?other, "ignoring signal on fire_and_forget requester"),
        }
    }

    fn close(&mut self, error: Option<RSocketError>) {
        if self.done {
            return;
        }
        self.done = true;
        self.payload = None;
        self.receiver
            .on_error(error.unwrap_or_else(|| RSocketError::connection_close("connection closed")));
    }

    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Collects a fragmented REQUEST_FNF before handing it to the application.
///
/// An unfragmented request never needs a registry entry and is dispatched
/// by the multiplexer directly.
pub(crate) struct FireAndForgetResponder {
    stream_id: u32,
    responder: Arc<dyn Responder>,
    holder: FragmentsHolder,
    done: bool,
}

impl FireAndForgetResponder {
    pub(crate) fn new(stream_id: u32, responder: Arc<dyn Responder>, first: Payload) -> Self {
        let mut holder = FragmentsHolder::new();
        holder.add(first);
        Self {
            stream_id,
            responder,
            holder,
            done: false,
        }
    }
}

impl StreamHandler for FireAndForgetResponder {
    fn stream_id(&self) -> Option<u32> {
        Some(self.stream_id)
    }

    fn kind(&self) -> &'static str {
        "fire_and_forget responder"
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut StreamContext<'_>) {
        if self.done {
            return;
        }
        match frame.body {
            FrameBody::Payload(payload) if frame.flags.has_follows() => self.holder.add(payload),
            FrameBody::Payload(payload) => {
                self.done = true;
                let payload = self.holder.reassemble(payload);
                self.responder.fire_and_forget(payload);
            }
            FrameBody::Cancel | FrameBody::Error { .. } => {
                self.done = true;
                self.holder.cancel();
            }
            _ => {
                self.done = true;
                self.holder.cancel();
                ctx.send_error(
                    self.stream_id,
                    &RSocketError::invalid(format!(
                        "unexpected frame {} during request reassembly",
                        frame.frame_type()
                    )),
                );
            }
        }
    }

    fn handle_signal(&mut self, signal: StreamSignal, _ctx: &mut StreamContext<'_>) {
        debug!(signal = ?signal, "ignoring signal on fire_and_forget responder");
    }

    fn close(&mut self, _error: Option<RSocketError>) {
        self.done = true;
        self.holder.cancel();
    }

    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Event, Recorder, TestResponder};
    use bytes::Bytes;
    use rsocket_protocol::{ErrorCode, Flags};
    use std::collections::VecDeque;

    #[test]
    fn test_requester_sends_once_and_completes() {
        let (recorder, events) = Recorder::new();
        let mut requester = FireAndForgetRequester::new(Payload::from_data("hi"), Box::new(recorder));
        let mut frames = VecDeque::new();
        let mut ctx = StreamContext::new(&mut frames, 0);

        assert!(requester.handle_ready(1, &mut ctx));
        assert!(requester.is_terminated());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type(), FrameType::RequestFnf);
        assert_eq!(*events.lock(), vec![Event::Complete]);

        // Closing afterwards is a no-op
        requester.close(Some(RSocketError::connection_close("bye")));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_requester_cancelled_while_pending_never_sends() {
        let (recorder, events) = Recorder::new();
        let mut requester = FireAndForgetRequester::new(Payload::from_data("hi"), Box::new(recorder));
        let mut frames = VecDeque::new();
        let mut ctx = StreamContext::new(&mut frames, 0);

        requester.handle_signal(StreamSignal::Cancel, &mut ctx);
        assert!(requester.is_terminated());
        assert!(!requester.handle_ready(1, &mut ctx));
        assert!(frames.is_empty());
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_responder_reassembles_before_delivery() {
        let responder = TestResponder::new();
        let mut stream = FireAndForgetResponder::new(
            1,
            Arc::new(responder.clone()),
            Payload::from_data("ab"),
        );
        let mut frames = VecDeque::new();
        let mut ctx = StreamContext::new(&mut frames, 0);

        stream.handle_frame(
            Frame::payload(1, Payload::from_data("cd"), Flags::NEXT | Flags::FOLLOWS),
            &mut ctx,
        );
        assert!(responder.fire_and_forgets().is_empty());

        stream.handle_frame(Frame::payload(1, Payload::from_data("ef"), Flags::NEXT), &mut ctx);
        assert!(stream.is_terminated());
        assert_eq!(responder.fire_and_forgets(), vec![Payload::from_data("abcdef")]);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_responder_rejects_ext_mid_reassembly() {
        let responder = TestResponder::new();
        let mut stream = FireAndForgetResponder::new(
            1,
            Arc::new(responder.clone()),
            Payload::from_data("ab"),
        );
        let mut frames = VecDeque::new();
        let mut ctx = StreamContext::new(&mut frames, 0);

        stream.handle_frame(Frame::ext(1, 9, Bytes::new(), false), &mut ctx);
        assert!(stream.is_terminated());
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].body,
            FrameBody::Error {
                code: ErrorCode::Invalid,
                ..
            }
        ));
        assert!(responder.fire_and_forgets().is_empty());
    }
}
