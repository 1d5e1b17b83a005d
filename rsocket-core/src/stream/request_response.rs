//! Request-response: one request, exactly one reply.

use super::{Phase, PendingExtension, StreamContext, StreamHandler};
use crate::error::RSocketError;
use crate::reassembler::FragmentsHolder;
use crate::responder::Responder;
use crate::signal::{StreamHandle, StreamSignal};
use crate::subscriber::{Subscriber, Subscription};
use rsocket_protocol::{Flags, Frame, FrameBody, FrameType, Payload};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct RequestResponseRequester {
    phase: Phase,
    payload: Option<Payload>,
    receiver: Box<dyn Subscriber>,
    holder: FragmentsHolder,
    extension: Option<PendingExtension>,
    done: bool,
}

impl RequestResponseRequester {
    pub(crate) fn new(payload: Payload, receiver: Box<dyn Subscriber>) -> Self {
        Self {
            phase: Phase::Pending {
                initial_request_n: 1,
            },
            payload: Some(payload),
            receiver,
            holder: FragmentsHolder::new(),
            extension: None,
            done: false,
        }
    }

    fn violation(&mut self, frame_type: FrameType, ctx: &mut StreamContext<'_>) {
        let error = RSocketError::invalid(format!(
            "unexpected frame {frame_type} on request_response stream"
        ));
        warn!(stream_id = ?self.phase.stream_id(), %frame_type, "protocol violation");
        self.done = true;
        self.holder.cancel();
        if let Some(stream_id) = self.phase.stream_id() {
            ctx.send_error(stream_id, &error);
        }
        self.receiver.on_error(error);
    }
}

impl StreamHandler for RequestResponseRequester {
    fn stream_id(&self) -> Option<u32> {
        self.phase.stream_id()
    }

    fn kind(&self) -> &'static str {
        "request_response requester"
    }

    fn handle_ready(&mut self, stream_id: u32, ctx: &mut StreamContext<'_>) -> bool {
        if self.done {
            return false;
        }
        self.phase = Phase::Active { stream_id };
        let payload = self.payload.take().unwrap_or_default();
        ctx.send_request(stream_id, FrameType::RequestResponse, payload, 0, false);
        if let Some(extension) = self.extension.take() {
            ctx.send_extension(stream_id, extension);
        }
        true
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut StreamContext<'_>) {
        if self.done {
            debug!(stream_id = frame.stream_id, "frame after completion ignored");
            return;
        }
        let flags = frame.flags;
        let frame_type = frame.frame_type();
        match frame.body {
            FrameBody::Payload(payload) => {
                if flags.has_follows() {
                    self.holder.add(payload);
                    return;
                }
                self.done = true;
                let payload = if self.holder.has_fragments() {
                    self.holder.reassemble(payload)
                } else {
                    payload
                };
                if flags.has_next() {
                    self.receiver.on_next(payload, true);
                } else {
                    self.receiver.on_complete();
                }
            }
            FrameBody::Error { code, message } => {
                self.done = true;
                self.holder.cancel();
                self.receiver.on_error(RSocketError::new(code, message));
            }
            FrameBody::Ext {
                extended_type,
                content,
            } => self
                .receiver
                .on_extension(extended_type, content, flags.has_ignore()),
            _ => self.violation(frame_type, ctx),
        }
    }

    fn handle_signal(&mut self, signal: StreamSignal, ctx: &mut StreamContext<'_>) {
        if self.done {
            return;
        }
        match signal {
            StreamSignal::Cancel => {
                self.done = true;
                self.holder.cancel();
                if let Some(stream_id) = self.phase.stream_id() {
                    ctx.send_cancel(stream_id);
                }
            }
            StreamSignal::Extension {
                extended_type,
                content,
                can_be_ignored,
            } => {
                let extension = PendingExtension {
                    extended_type,
                    content,
                    can_be_ignored,
                };
                match self.phase.stream_id() {
                    Some(stream_id) => ctx.send_extension(stream_id, extension),
                    None => self.extension = Some(extension),
                }
            }
            other => debug!(signal = ?other, "ignoring signal on request_response requester"),
        }
    }

    fn close(&mut self, error: Option<RSocketError>) {
        if self.done {
            return;
        }
        self.done = true;
        self.holder.cancel();
        match error {
            Some(error) => self.receiver.on_error(error),
            None => self.receiver.on_complete(),
        }
    }

    fn is_terminated(&self) -> bool {
        self.done
    }
}

pub(crate) struct RequestResponseResponder {
    stream_id: u32,
    responder: Arc<dyn Responder>,
    sender: Option<StreamHandle>,
    receiver: Option<Box<dyn Subscription>>,
    holder: FragmentsHolder,
    done: bool,
}

impl RequestResponseResponder {
    /// Builds the responder from the initiating frame. The application is
    /// invoked right away unless the request is fragmented.
    pub(crate) fn new(
        stream_id: u32,
        flags: Flags,
        payload: Payload,
        responder: Arc<dyn Responder>,
        sender: StreamHandle,
    ) -> Self {
        let mut stream = Self {
            stream_id,
            responder,
            sender: Some(sender),
            receiver: None,
            holder: FragmentsHolder::new(),
            done: false,
        };
        if flags.has_follows() {
            stream.holder.add(payload);
        } else {
            stream.invoke(payload);
        }
        stream
    }

    fn invoke(&mut self, payload: Payload) {
        if let Some(sender) = self.sender.take() {
            self.receiver = Some(self.responder.request_response(payload, sender));
        }
    }

    fn cancel_receiver(&mut self) {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.cancel();
        }
    }
}

impl StreamHandler for RequestResponseResponder {
    fn stream_id(&self) -> Option<u32> {
        Some(self.stream_id)
    }

    fn kind(&self) -> &'static str {
        "request_response responder"
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut StreamContext<'_>) {
        if self.done {
            return;
        }
        let flags = frame.flags;
        let frame_type = frame.frame_type();
        match frame.body {
            FrameBody::Payload(payload) if self.receiver.is_none() => {
                if flags.has_follows() {
                    self.holder.add(payload);
                } else {
                    let payload = self.holder.reassemble(payload);
                    self.invoke(payload);
                }
            }
            FrameBody::Cancel | FrameBody::Error { .. } => {
                self.done = true;
                self.holder.cancel();
                self.cancel_receiver();
            }
            FrameBody::Ext {
                extended_type,
                content,
            } if self.receiver.is_some() => {
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.on_extension(extended_type, content, flags.has_ignore());
                }
            }
            _ => {
                warn!(stream_id = self.stream_id, %frame_type, "protocol violation");
                self.done = true;
                self.holder.cancel();
                ctx.send_error(
                    self.stream_id,
                    &RSocketError::invalid(format!(
                        "unexpected frame {frame_type} on request_response stream"
                    )),
                );
                self.cancel_receiver();
            }
        }
    }

    fn handle_signal(&mut self, signal: StreamSignal, ctx: &mut StreamContext<'_>) {
        match signal {
            StreamSignal::Next { .. } | StreamSignal::Complete | StreamSignal::Error(_)
                if self.done =>
            {
                warn!(stream_id = self.stream_id, "dropping response on terminated stream");
            }
            StreamSignal::Next { payload, .. } => {
                self.done = true;
                ctx.send_next(self.stream_id, payload, true);
            }
            StreamSignal::Complete => {
                self.done = true;
                ctx.send_complete(self.stream_id);
            }
            StreamSignal::Error(error) => {
                self.done = true;
                ctx.send_error(self.stream_id, &error);
            }
            StreamSignal::Extension {
                extended_type,
                content,
                can_be_ignored,
            } if !self.done => ctx.send_extension(
                self.stream_id,
                PendingExtension {
                    extended_type,
                    content,
                    can_be_ignored,
                },
            ),
            other => debug!(signal = ?other, "ignoring signal on request_response responder"),
        }
    }

    fn close(&mut self, _error: Option<RSocketError>) {
        if self.done {
            return;
        }
        self.done = true;
        self.holder.cancel();
        self.cancel_receiver();
    }

    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{detached_handle, Event, Recorder, TestResponder, Wire};
    use rsocket_protocol::ErrorCode;

    fn active_requester(wire: &mut Wire) -> (RequestResponseRequester, crate::test_support::Events) {
        let (recorder, events) = Recorder::new();
        let mut requester =
            RequestResponseRequester::new(Payload::from_data("ping"), Box::new(recorder));
        assert!(requester.handle_ready(1, &mut wire.ctx()));
        (requester, events)
    }

    #[test]
    fn test_requester_single_reply() {
        let mut wire = Wire::new();
        let (mut requester, events) = active_requester(&mut wire);

        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_type(), FrameType::RequestResponse);
        assert_eq!(sent[0].payload_ref().unwrap().data_utf8(), Some("ping"));

        requester.handle_frame(
            Frame::payload(1, Payload::from_data("pong"), Flags::NEXT | Flags::COMPLETE),
            &mut wire.ctx(),
        );
        assert!(requester.is_terminated());
        assert_eq!(*events.lock(), vec![Event::next("pong", true)]);
    }

    #[test]
    fn test_requester_empty_completion() {
        let mut wire = Wire::new();
        let (mut requester, events) = active_requester(&mut wire);
        requester.handle_frame(Frame::complete(1), &mut wire.ctx());
        assert_eq!(*events.lock(), vec![Event::Complete]);
    }

    #[test]
    fn test_requester_reassembles_reply() {
        let mut wire = Wire::new();
        let (mut requester, events) = active_requester(&mut wire);

        requester.handle_frame(
            Frame::payload(1, Payload::from_data("po"), Flags::NEXT | Flags::FOLLOWS),
            &mut wire.ctx(),
        );
        assert!(events.lock().is_empty());
        requester.handle_frame(
            Frame::payload(1, Payload::from_data("ng"), Flags::NEXT | Flags::COMPLETE),
            &mut wire.ctx(),
        );
        assert_eq!(*events.lock(), vec![Event::next("pong", true)]);
    }

    #[test]
    fn test_requester_cancel_is_idempotent() {
        let mut wire = Wire::new();
        let (mut requester, events) = active_requester(&mut wire);
        wire.take();

        requester.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        requester.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        requester.close(Some(RSocketError::connection_close("gone")));

        let sent = wire.take();
        assert_eq!(sent, vec![Frame::cancel(1)]);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_requester_pending_extension_follows_request() {
        let (recorder, _events) = Recorder::new();
        let mut requester = RequestResponseRequester::new(Payload::from_data("x"), Box::new(recorder));
        let mut wire = Wire::new();
        requester.handle_signal(
            StreamSignal::Extension {
                extended_type: 7,
                content: bytes::Bytes::from_static(b"ext"),
                can_be_ignored: true,
            },
            &mut wire.ctx(),
        );
        assert!(wire.take().is_empty());

        assert!(requester.handle_ready(3, &mut wire.ctx()));
        let sent = wire.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].frame_type(), FrameType::Ext);
        assert!(sent[1].flags.has_ignore());
    }

    #[test]
    fn test_requester_request_n_is_invalid() {
        let mut wire = Wire::new();
        let (mut requester, events) = active_requester(&mut wire);
        wire.take();

        requester.handle_frame(Frame::request_n(1, 5), &mut wire.ctx());
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].body,
            FrameBody::Error {
                code: ErrorCode::Invalid,
                ..
            }
        ));
        let events = events.lock();
        assert!(matches!(
            &events[..],
            [Event::Error(RSocketError {
                code: ErrorCode::Invalid,
                ..
            })]
        ));
    }

    #[test]
    fn test_responder_ping_pong() {
        let responder = TestResponder::new();
        let mut wire = Wire::new();
        let mut stream = RequestResponseResponder::new(
            1,
            Flags::NONE,
            Payload::from_data("ping"),
            Arc::new(responder.clone()),
            detached_handle(),
        );

        let invocations = responder.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].payload.data_utf8(), Some("ping"));

        stream.handle_signal(
            StreamSignal::Next {
                payload: Payload::from_data("pong"),
                complete: false,
            },
            &mut wire.ctx(),
        );
        assert!(stream.is_terminated());

        // A second response is dropped
        stream.handle_signal(StreamSignal::Complete, &mut wire.ctx());
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].flags.has_next());
        assert!(sent[0].flags.has_complete());
        assert_eq!(sent[0].payload_ref().unwrap().data_utf8(), Some("pong"));
    }

    #[test]
    fn test_responder_cancel_reaches_application() {
        let responder = TestResponder::new();
        let mut wire = Wire::new();
        let mut stream = RequestResponseResponder::new(
            1,
            Flags::NONE,
            Payload::from_data("ping"),
            Arc::new(responder.clone()),
            detached_handle(),
        );
        stream.handle_frame(Frame::cancel(1), &mut wire.ctx());
        stream.close(None);

        assert!(stream.is_terminated());
        assert!(wire.take().is_empty());
        let events = responder.invocations()[0].events.lock().clone();
        assert_eq!(events, vec![Event::Cancel]);
    }

    #[test]
    fn test_responder_defers_until_reassembled() {
        let responder = TestResponder::new();
        let mut wire = Wire::new();
        let mut stream = RequestResponseResponder::new(
            1,
            Flags::FOLLOWS,
            Payload::from_data("pi"),
            Arc::new(responder.clone()),
            detached_handle(),
        );
        assert!(responder.invocations().is_empty());

        stream.handle_frame(Frame::payload(1, Payload::from_data("ng"), Flags::NEXT), &mut wire.ctx());
        let invocations = responder.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].payload.data_utf8(), Some("ping"));
    }

    #[test]
    fn test_responder_error_signal() {
        let responder = TestResponder::new();
        let mut wire = Wire::new();
        let mut stream = RequestResponseResponder::new(
            1,
            Flags::NONE,
            Payload::from_data("ping"),
            Arc::new(responder),
            detached_handle(),
        );
        stream.handle_signal(
            StreamSignal::Error(RSocketError::new(ErrorCode::Custom(0x301), "nope")),
            &mut wire.ctx(),
        );
        assert_eq!(
            wire.take(),
            vec![Frame::error(1, ErrorCode::Custom(0x301), "nope")]
        );
    }
}
