//! Request-channel: two independently flow-controlled directions.
//!
//! Each side tracks `inbound_done` and `outbound_done` separately. The
//! initiating REQUEST_CHANNEL frame carries the requester's first item and
//! may already close the requester's outbound direction with COMPLETE.

use super::{add_demand, OutboundFlow, Phase, PendingExtension, StreamContext, StreamHandler};
use crate::error::RSocketError;
use crate::reassembler::FragmentsHolder;
use crate::responder::Responder;
use crate::signal::{StreamHandle, StreamSignal};
use crate::subscriber::ChannelSubscriber;
use rsocket_protocol::{Flags, Frame, FrameBody, FrameType, Payload};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct RequestChannelRequester {
    phase: Phase,
    payload: Option<Payload>,
    is_complete: bool,
    receiver: Box<dyn ChannelSubscriber>,
    holder: FragmentsHolder,
    extension: Option<PendingExtension>,
    flow: OutboundFlow,
    inbound_done: bool,
    outbound_done: bool,
}

impl RequestChannelRequester {
    pub(crate) fn new(
        payload: Payload,
        initial_request_n: u32,
        is_complete: bool,
        receiver: Box<dyn ChannelSubscriber>,
    ) -> Self {
        Self {
            phase: Phase::Pending { initial_request_n },
            payload: Some(payload),
            is_complete,
            receiver,
            holder: FragmentsHolder::new(),
            extension: None,
            // The peer grants demand for anything after the first item
            flow: OutboundFlow::new(0),
            inbound_done: false,
            outbound_done: false,
        }
    }

    fn outbound_closing(&self) -> bool {
        self.outbound_done || self.is_complete || self.flow.is_completing()
    }

    fn flush(&mut self, ctx: &mut StreamContext<'_>) {
        let Some(stream_id) = self.phase.stream_id() else {
            return;
        };
        for (payload, complete) in self.flow.drain() {
            ctx.send_next(stream_id, payload, complete);
        }
        if self.flow.is_finished() {
            self.outbound_done = true;
        }
    }
}

impl StreamHandler for RequestChannelRequester {
    fn stream_id(&self) -> Option<u32> {
        self.phase.stream_id()
    }

    fn kind(&self) -> &'static str {
        "request_channel requester"
    }

    fn handle_ready(&mut self, stream_id: u32, ctx: &mut StreamContext<'_>) -> bool {
        let Phase::Pending { initial_request_n } = self.phase else {
            return false;
        };
        if self.inbound_done && self.outbound_done {
            return false;
        }
        self.phase = Phase::Active { stream_id };
        let payload = self.payload.take().unwrap_or_default();
        ctx.send_request(
            stream_id,
            FrameType::RequestChannel,
            payload,
            initial_request_n,
            self.is_complete,
        );
        if self.is_complete {
            self.outbound_done = true;
        }
        if let Some(extension) = self.extension.take() {
            ctx.send_extension(stream_id, extension);
        }
        true
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut StreamContext<'_>) {
        let flags = frame.flags;
        let frame_type = frame.frame_type();
        match frame.body {
            FrameBody::Payload(payload) => {
                if self.inbound_done {
                    debug!(stream_id = frame.stream_id, "payload after inbound completion ignored");
                    return;
                }
                let complete = flags.has_complete();
                if flags.has_follows() && !complete {
                    self.holder.add(payload);
                    return;
                }
                if complete {
                    self.inbound_done = true;
                    if !flags.has_next() {
                        self.holder.cancel();
                        self.receiver.on_complete();
                        return;
                    }
                }
                let payload = if self.holder.has_fragments() {
                    self.holder.reassemble(payload)
                } else {
                    payload
                };
                self.receiver.on_next(payload, complete);
            }
            FrameBody::Cancel => {
                if self.outbound_done {
                    return;
                }
                self.outbound_done = true;
                self.flow.clear();
                self.receiver.cancel();
            }
            FrameBody::RequestN { request_n } => {
                if self.outbound_done {
                    return;
                }
                self.flow.grant(request_n);
                self.flush(ctx);
                self.receiver.request(request_n);
            }
            FrameBody::Error { code, message } => {
                if self.inbound_done && self.outbound_done {
                    return;
                }
                let outbound_done = self.outbound_done;
                self.inbound_done = true;
                self.outbound_done = true;
                self.holder.cancel();
                self.flow.clear();
                if !outbound_done {
                    self.receiver.cancel();
                }
                self.receiver.on_error(RSocketError::new(code, message));
            }
            FrameBody::Ext {
                extended_type,
                content,
            } => {
                if self.inbound_done && self.outbound_done {
                    return;
                }
                self.receiver
                    .on_extension(extended_type, content, flags.has_ignore());
            }
            _ => {
                if self.inbound_done && self.outbound_done {
                    return;
                }
                warn!(stream_id = frame.stream_id, %frame_type, "protocol violation");
                let error = RSocketError::invalid(format!(
                    "unexpected frame {frame_type} on request_channel stream"
                ));
                ctx.send_error(frame.stream_id, &error);
                self.close(Some(error));
            }
        }
    }

    fn handle_signal(&mut self, signal: StreamSignal, ctx: &mut StreamContext<'_>) {
        match signal {
            StreamSignal::Request(n) => {
                if self.inbound_done {
                    return;
                }
                match self.phase {
                    Phase::Pending { initial_request_n } => {
                        self.phase = Phase::Pending {
                            initial_request_n: add_demand(initial_request_n, n),
                        };
                    }
                    Phase::Active { stream_id } => ctx.send_request_n(stream_id, n),
                }
            }
            StreamSignal::Cancel => {
                let inbound_done = self.inbound_done;
                let outbound_done = self.outbound_done;
                if inbound_done && outbound_done {
                    return;
                }
                self.inbound_done = true;
                self.outbound_done = true;
                self.holder.cancel();
                self.flow.clear();
                if !outbound_done {
                    self.receiver.cancel();
                }
                let Some(stream_id) = self.phase.stream_id() else {
                    return;
                };
                if inbound_done {
                    ctx.send_error(stream_id, &RSocketError::canceled());
                } else {
                    ctx.send_cancel(stream_id);
                }
            }
            StreamSignal::Next { .. } | StreamSignal::Complete if self.outbound_closing() => {
                warn!(stream_id = ?self.phase.stream_id(), "dropping signal after outbound completion");
            }
            StreamSignal::Next { payload, complete } => {
                self.flow.push(payload, complete);
                self.flush(ctx);
            }
            StreamSignal::Complete => {
                if !self.flow.complete() {
                    return;
                }
                match self.phase {
                    // Rides on the initiating frame
                    Phase::Pending { .. } => self.is_complete = true,
                    Phase::Active { stream_id } => {
                        self.outbound_done = true;
                        ctx.send_complete(stream_id);
                    }
                }
            }
            StreamSignal::Error(error) => {
                if self.outbound_done {
                    warn!(stream_id = ?self.phase.stream_id(), "dropping error after outbound completion");
                    return;
                }
                let inbound_done = self.inbound_done;
                self.inbound_done = true;
                self.outbound_done = true;
                self.holder.cancel();
                self.flow.clear();
                if let Some(stream_id) = self.phase.stream_id() {
                    ctx.send_error(stream_id, &error);
                }
                if !inbound_done {
                    self.receiver.on_error(error);
                }
            }
            StreamSignal::Extension {
                extended_type,
                content,
                can_be_ignored,
            } => {
                if self.outbound_done {
                    return;
                }
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
        }
    }

    fn close(&mut self, error: Option<RSocketError>) {
        let inbound_done = self.inbound_done;
        let outbound_done = self.outbound_done;
        if inbound_done && outbound_done {
            return;
        }
        self.inbound_done = true;
        self.outbound_done = true;
        self.holder.cancel();
        self.flow.clear();
        if !outbound_done {
            self.receiver.cancel();
        }
        if !inbound_done {
            match error {
                Some(error) => self.receiver.on_error(error),
                None => self.receiver.on_complete(),
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.inbound_done && self.outbound_done
    }
}

pub(crate) struct RequestChannelResponder {
    stream_id: u32,
    initial_request_n: u32,
    initial_complete: bool,
    responder: Arc<dyn Responder>,
    sender: Option<StreamHandle>,
    receiver: Option<Box<dyn ChannelSubscriber>>,
    holder: FragmentsHolder,
    flow: OutboundFlow,
    inbound_done: bool,
    outbound_done: bool,
}

impl RequestChannelResponder {
    /// Builds the responder from the initiating frame. A fragmented request
    /// is reassembled before the application sees it.
    pub(crate) fn new(
        stream_id: u32,
        flags: Flags,
        initial_request_n: u32,
        payload: Payload,
        responder: Arc<dyn Responder>,
        sender: StreamHandle,
    ) -> Self {
        let mut stream = Self {
            stream_id,
            initial_request_n,
            initial_complete: flags.has_complete(),
            responder,
            sender: Some(sender),
            receiver: None,
            holder: FragmentsHolder::new(),
            flow: OutboundFlow::new(initial_request_n),
            inbound_done: false,
            outbound_done: false,
        };
        if flags.has_follows() {
            stream.holder.add(payload);
        } else {
            let complete = stream.initial_complete;
            stream.inbound_done = complete;
            stream.invoke(payload, complete);
        }
        stream
    }

    fn invoke(&mut self, payload: Payload, is_complete: bool) {
        if let Some(sender) = self.sender.take() {
            self.receiver = Some(self.responder.request_channel(
                payload,
                self.initial_request_n,
                is_complete,
                sender,
            ));
        }
    }

    fn flush(&mut self, ctx: &mut StreamContext<'_>) {
        for (payload, complete) in self.flow.drain() {
            ctx.send_next(self.stream_id, payload, complete);
        }
        if self.flow.is_finished() {
            self.outbound_done = true;
        }
    }

    /// Peer terminated the whole channel with CANCEL or ERROR.
    fn terminate(&mut self, error: RSocketError) {
        let inbound_done = self.inbound_done;
        let outbound_done = self.outbound_done;
        self.inbound_done = true;
        self.outbound_done = true;
        self.holder.cancel();
        self.flow.clear();
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        if !outbound_done {
            receiver.cancel();
        }
        if !inbound_done {
            receiver.on_error(error);
        }
    }

    fn violation(&mut self, frame_type: FrameType, ctx: &mut StreamContext<'_>) {
        let message = if self.receiver.is_none() {
            format!("unexpected frame {frame_type} during request reassembly")
        } else {
            format!("unexpected frame {frame_type} on request_channel stream")
        };
        warn!(stream_id = self.stream_id, %frame_type, "protocol violation");
        let error = RSocketError::invalid(message);
        ctx.send_error(self.stream_id, &error);
        self.close(Some(error));
    }
}

impl StreamHandler for RequestChannelResponder {
    fn stream_id(&self) -> Option<u32> {
        Some(self.stream_id)
    }

    fn kind(&self) -> &'static str {
        "request_channel responder"
    }

    fn handle_frame(&mut self, frame: Frame, ctx: &mut StreamContext<'_>) {
        if self.inbound_done && self.outbound_done {
            return;
        }
        let flags = frame.flags;
        let frame_type = frame.frame_type();
        match frame.body {
            FrameBody::Payload(payload) if self.receiver.is_none() => {
                if flags.has_follows() {
                    self.holder.add(payload);
                    return;
                }
                let payload = self.holder.reassemble(payload);
                let complete = self.initial_complete || flags.has_complete();
                self.inbound_done = complete;
                self.invoke(payload, complete);
            }
            FrameBody::Payload(payload) => {
                if self.inbound_done {
                    debug!(stream_id = self.stream_id, "payload after inbound completion ignored");
                    return;
                }
                let complete = flags.has_complete();
                if flags.has_follows() && !complete {
                    self.holder.add(payload);
                    return;
                }
                let Some(receiver) = self.receiver.as_mut() else {
                    return;
                };
                if complete {
                    self.inbound_done = true;
                    if !flags.has_next() {
                        self.holder.cancel();
                        receiver.on_complete();
                        return;
                    }
                }
                let payload = if self.holder.has_fragments() {
                    self.holder.reassemble(payload)
                } else {
                    payload
                };
                receiver.on_next(payload, complete);
            }
            FrameBody::RequestN { request_n } if self.receiver.is_some() => {
                if self.outbound_done {
                    return;
                }
                self.flow.grant(request_n);
                self.flush(ctx);
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.request(request_n);
                }
            }
            FrameBody::Cancel => self.terminate(RSocketError::canceled()),
            FrameBody::Error { code, message } => self.terminate(RSocketError::new(code, message)),
            FrameBody::Ext {
                extended_type,
                content,
            } if self.receiver.is_some() => {
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.on_extension(extended_type, content, flags.has_ignore());
                }
            }
            _ => self.violation(frame_type, ctx),
        }
    }

    fn handle_signal(&mut self, signal: StreamSignal, ctx: &mut StreamContext<'_>) {
        match signal {
            StreamSignal::Next { .. } | StreamSignal::Complete | StreamSignal::Error(_)
                if self.outbound_done || self.flow.is_completing() =>
            {
                warn!(stream_id = self.stream_id, "dropping signal after outbound completion");
            }
            StreamSignal::Next { payload, complete } => {
                self.flow.push(payload, complete);
                self.flush(ctx);
            }
            StreamSignal::Complete => {
                if self.flow.complete() {
                    self.outbound_done = true;
                    ctx.send_complete(self.stream_id);
                }
            }
            StreamSignal::Error(error) => {
                let inbound_done = self.inbound_done;
                self.inbound_done = true;
                self.outbound_done = true;
                self.holder.cancel();
                self.flow.clear();
                ctx.send_error(self.stream_id, &error);
                if !inbound_done {
                    if let Some(receiver) = self.receiver.as_mut() {
                        receiver.cancel();
                    }
                }
            }
            StreamSignal::Request(n) => {
                if !self.inbound_done {
                    ctx.send_request_n(self.stream_id, n);
                }
            }
            StreamSignal::Cancel => {
                if self.inbound_done {
                    return;
                }
                self.inbound_done = true;
                self.holder.cancel();
                ctx.send_cancel(self.stream_id);
            }
            StreamSignal::Extension {
                extended_type,
                content,
                can_be_ignored,
            } => {
                if self.inbound_done && self.outbound_done {
                    return;
                }
                ctx.send_extension(
                    self.stream_id,
                    PendingExtension {
                        extended_type,
                        content,
                        can_be_ignored,
                    },
                );
            }
        }
    }

    fn close(&mut self, error: Option<RSocketError>) {
        let inbound_done = self.inbound_done;
        let outbound_done = self.outbound_done;
        if inbound_done && outbound_done {
            return;
        }
        self.inbound_done = true;
        self.outbound_done = true;
        self.holder.cancel();
        self.flow.clear();
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        if !outbound_done {
            receiver.cancel();
        }
        if !inbound_done {
            match error {
                Some(error) => receiver.on_error(error),
                None => receiver.on_complete(),
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.inbound_done && self.outbound_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{detached_handle, Event, Events, Recorder, TestResponder, Wire};
    use rsocket_protocol::ErrorCode;

    fn requester(payload: &'static str, initial_request_n: u32, is_complete: bool) -> (RequestChannelRequester, Events) {
        let (recorder, events) = Recorder::new();
        (
            RequestChannelRequester::new(
                Payload::from_data(payload),
                initial_request_n,
                is_complete,
                Box::new(recorder),
            ),
            events,
        )
    }

    fn responder(flags: Flags, initial_request_n: u32, payload: &'static str) -> (RequestChannelResponder, TestResponder) {
        let app = TestResponder::new();
        let stream = RequestChannelResponder::new(
            1,
            flags,
            initial_request_n,
            Payload::from_data(payload),
            Arc::new(app.clone()),
            detached_handle(),
        );
        (stream, app)
    }

    fn next(data: &'static str) -> StreamSignal {
        StreamSignal::Next {
            payload: Payload::from_data(data),
            complete: false,
        }
    }

    fn item(data: &'static str, flags: Flags) -> Frame {
        Frame::payload(1, Payload::from_data(data), flags)
    }

    #[test]
    fn test_requester_completed_on_first_frame() {
        let (mut stream, events) = requester("a", 2, true);
        let mut wire = Wire::new();
        assert!(stream.handle_ready(1, &mut wire.ctx()));

        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_type(), FrameType::RequestChannel);
        assert!(sent[0].flags.has_complete());
        assert_eq!(sent[0].payload_ref().unwrap().data_utf8(), Some("a"));

        stream.handle_frame(item("x", Flags::NEXT), &mut wire.ctx());
        stream.handle_frame(item("y", Flags::NEXT), &mut wire.ctx());
        stream.handle_signal(next("late"), &mut wire.ctx());
        stream.handle_frame(Frame::complete(1), &mut wire.ctx());

        assert!(stream.is_terminated());
        assert!(wire.take().is_empty());
        assert_eq!(
            *events.lock(),
            vec![Event::next("x", false), Event::next("y", false), Event::Complete]
        );
    }

    #[test]
    fn test_requester_outbound_waits_for_demand() {
        let (mut stream, events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_ready(1, &mut wire.ctx());
        wire.take();

        stream.handle_signal(next("b"), &mut wire.ctx());
        stream.handle_signal(StreamSignal::Complete, &mut wire.ctx());
        assert!(wire.take().is_empty());

        stream.handle_frame(Frame::request_n(1, 4), &mut wire.ctx());
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload_ref().unwrap().data_utf8(), Some("b"));
        assert!(sent[0].flags.has_complete());
        assert_eq!(*events.lock(), vec![Event::Request(4)]);
        assert!(!stream.is_terminated());
    }

    #[test]
    fn test_requester_complete_while_pending_rides_on_request() {
        let (mut stream, _events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_signal(StreamSignal::Request(2), &mut wire.ctx());
        stream.handle_signal(StreamSignal::Complete, &mut wire.ctx());
        assert!(wire.take().is_empty());

        stream.handle_ready(1, &mut wire.ctx());
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].flags.has_complete());
        assert!(matches!(
            sent[0].body,
            FrameBody::RequestChannel {
                initial_request_n: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_requester_cancel_while_receiving_sends_cancel() {
        let (mut stream, events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_ready(1, &mut wire.ctx());
        wire.take();

        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        stream.close(Some(RSocketError::connection_close("gone")));

        assert_eq!(wire.take(), vec![Frame::cancel(1)]);
        assert!(stream.is_terminated());
        assert_eq!(*events.lock(), vec![Event::Cancel]);
    }

    #[test]
    fn test_requester_cancel_after_inbound_complete_sends_error() {
        let (mut stream, _events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_ready(1, &mut wire.ctx());
        stream.handle_frame(Frame::complete(1), &mut wire.ctx());
        wire.take();

        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        assert_eq!(
            wire.take(),
            vec![Frame::error(1, ErrorCode::Canceled, "Cancelled")]
        );
    }

    #[test]
    fn test_requester_cancel_while_pending_sends_nothing() {
        let (mut stream, _events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        assert!(stream.is_terminated());
        assert!(!stream.handle_ready(1, &mut wire.ctx()));
        assert!(wire.take().is_empty());
    }

    #[test]
    fn test_requester_error_frame_cancels_then_errors() {
        let (mut stream, events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_ready(1, &mut wire.ctx());
        stream.handle_frame(
            Frame::error(1, ErrorCode::ApplicationError, "boom"),
            &mut wire.ctx(),
        );
        stream.handle_frame(
            Frame::error(1, ErrorCode::ApplicationError, "again"),
            &mut wire.ctx(),
        );

        assert!(stream.is_terminated());
        assert_eq!(
            *events.lock(),
            vec![Event::Cancel, Event::Error(RSocketError::application("boom"))]
        );
    }

    #[test]
    fn test_requester_close_notifies_once() {
        let (mut stream, events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_ready(1, &mut wire.ctx());

        let error = RSocketError::connection_close("closed");
        stream.close(Some(error.clone()));
        stream.close(Some(error.clone()));
        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());

        assert_eq!(
            *events.lock(),
            vec![Event::Cancel, Event::Error(error)]
        );
        assert_eq!(wire.take().len(), 1);
    }

    #[test]
    fn test_requester_unexpected_frame_is_invalid() {
        let (mut stream, events) = requester("a", 1, false);
        let mut wire = Wire::new();
        stream.handle_ready(1, &mut wire.ctx());
        wire.take();

        stream.handle_frame(
            Frame::request(FrameType::RequestResponse, 1, Payload::default(), 0, Flags::NONE),
            &mut wire.ctx(),
        );
        let sent = wire.take();
        assert!(matches!(
            sent[..],
            [Frame {
                body: FrameBody::Error {
                    code: ErrorCode::Invalid,
                    ..
                },
                ..
            }]
        ));
        assert!(stream.is_terminated());
        let events = events.lock();
        assert_eq!(events[0], Event::Cancel);
        assert!(matches!(
            &events[1],
            Event::Error(RSocketError {
                code: ErrorCode::Invalid,
                ..
            })
        ));
    }

    #[test]
    fn test_responder_fragmented_request_invokes_once() {
        let (mut stream, app) = responder(Flags::FOLLOWS, 4, "he");
        let mut wire = Wire::new();
        stream.handle_frame(item("ll", Flags::NEXT | Flags::FOLLOWS), &mut wire.ctx());
        assert!(app.invocations().is_empty());
        stream.handle_frame(item("o", Flags::NEXT | Flags::COMPLETE), &mut wire.ctx());

        let invocations = app.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].payload.data_utf8(), Some("hello"));
        assert_eq!(invocations[0].initial_request_n, 4);
        assert!(invocations[0].is_complete);
        assert!(wire.take().is_empty());
    }

    #[test]
    fn test_responder_request_n_mid_reassembly_is_invalid() {
        let (mut stream, app) = responder(Flags::FOLLOWS, 4, "he");
        let mut wire = Wire::new();
        stream.handle_frame(Frame::request_n(1, 2), &mut wire.ctx());

        assert!(stream.is_terminated());
        assert!(app.invocations().is_empty());
        let sent = wire.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0].body,
            FrameBody::Error { code: ErrorCode::Invalid, message } if message.contains("reassembly")
        ));
    }

    #[test]
    fn test_responder_streams_both_directions() {
        let (mut stream, app) = responder(Flags::NONE, 2, "a");
        let mut wire = Wire::new();
        let events = app.invocations()[0].events.clone();

        stream.handle_signal(StreamSignal::Request(5), &mut wire.ctx());
        stream.handle_frame(item("b", Flags::NEXT), &mut wire.ctx());
        stream.handle_frame(Frame::complete(1), &mut wire.ctx());

        stream.handle_signal(next("x"), &mut wire.ctx());
        stream.handle_signal(next("y"), &mut wire.ctx());
        stream.handle_signal(next("z"), &mut wire.ctx());
        stream.handle_signal(StreamSignal::Complete, &mut wire.ctx());
        assert!(!stream.is_terminated());

        stream.handle_frame(Frame::request_n(1, 1), &mut wire.ctx());
        assert!(stream.is_terminated());

        let sent = wire.take();
        assert_eq!(sent[0], Frame::request_n(1, 5));
        let items: Vec<_> = sent[1..]
            .iter()
            .map(|f| (f.payload_ref().unwrap().data_utf8(), f.flags.has_complete()))
            .collect();
        assert_eq!(
            items,
            vec![(Some("x"), false), (Some("y"), false), (Some("z"), true)]
        );
        assert_eq!(
            *events.lock(),
            vec![Event::next("b", false), Event::Complete, Event::Request(1)]
        );
    }

    #[test]
    fn test_responder_cancel_from_peer() {
        let (mut stream, app) = responder(Flags::NONE, 2, "a");
        let mut wire = Wire::new();
        stream.handle_frame(Frame::cancel(1), &mut wire.ctx());
        stream.close(Some(RSocketError::connection_close("gone")));

        assert!(stream.is_terminated());
        assert!(wire.take().is_empty());
        assert_eq!(
            *app.invocations()[0].events.lock(),
            vec![Event::Cancel, Event::Error(RSocketError::canceled())]
        );
    }

    #[test]
    fn test_responder_local_cancel_sends_cancel_once() {
        let (mut stream, _app) = responder(Flags::NONE, 2, "a");
        let mut wire = Wire::new();
        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        stream.handle_signal(StreamSignal::Cancel, &mut wire.ctx());
        assert_eq!(wire.take(), vec![Frame::cancel(1)]);
        assert!(!stream.is_terminated());

        stream.handle_signal(StreamSignal::Complete, &mut wire.ctx());
        assert!(stream.is_terminated());
    }

    #[test]
    fn test_responder_close_before_handler_installed() {
        let (mut stream, app) = responder(Flags::FOLLOWS, 1, "a");
        stream.close(None);
        assert!(stream.is_terminated());
        assert!(app.invocations().is_empty());
    }
}
