//! Request-stream: one request, a flow-controlled sequence of replies.

use super::{add_demand, OutboundFlow, Phase, PendingExtension, StreamContext, StreamHandler};
use crate::error::RSocketError;
use crate::reassembler::FragmentsHolder;
use crate::responder::Responder;
use crate::signal::{StreamHandle, StreamSignal};
use crate::subscriber::{Subscriber, Subscription};
use rsocket_protocol::{Flags, Frame, FrameBody, FrameType, Payload};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct RequestStreamRequester {
    phase: Phase,
    payload: Option<Payload>,
    receiver: Box<dyn Subscriber>,
    holder: FragmentsHolder,
    extension: Option<PendingExtension>,
    done: bool,
}

impl RequestStreamRequester {
    pub(crate) fn new(payload: Payload, initial_request_n: u32, receiver: Box<dyn Subscriber>) -> Self {
        Self {
            phase: Phase::Pending { initial_request_n },
            payload: Some(payload),
            receiver,
            holder: FragmentsHolder::new(),
            extension: None,
            done: false,
        }
    }

    fn violation(&mut self, frame_type: FrameType, ctx: &mut StreamContext<'_>) {
        let error = RSocketError::invalid(format!(
            "unexpected frame {frame_type} on request_stream stream"
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

impl StreamHandler for RequestStreamRequester {
    fn stream_id(&self) -> Option<u32> {
        self.phase.stream_id()
    }

    fn kind(&self) -> &'static str {
        "request_stream requester"
    }

    fn handle_ready(&mut self, stream_id: u32, ctx: &mut StreamContext<'_>) -> bool {
        let Phase::Pending { initial_request_n } = self.phase else {
            return false;
        };
        if self.done {
            return false;
        }
        self.phase = Phase::Active { stream_id };
        let payload = self.payload.take().unwrap_or_default();
        ctx.send_request(
            stream_id,
            FrameType::RequestStream,
            payload,
            initial_request_n,
            false,
        );
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
                let complete = flags.has_complete();
                if flags.has_follows() && !complete {
                    self.holder.add(payload);
                    return;
                }
                if complete {
                    self.done = true;
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
            StreamSignal::Request(n) => match self.phase {
                Phase::Pending { initial_request_n } => {
                    self.phase = Phase::Pending {
                        initial_request_n: add_demand(initial_request_n, n),
                    };
                }
                Phase::Active { stream_id } => ctx.send_request_n(stream_id, n),
            },
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
            other => debug!(signal = ?other, "ignoring signal on request_stream requester"),
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

pub(crate) struct RequestStreamResponder {
    stream_id: u32,
    initial_request_n: u32,
    responder: Arc<dyn Responder>,
    sender: Option<StreamHandle>,
    receiver: Option<Box<dyn Subscription>>,
    holder: FragmentsHolder,
    flow: OutboundFlow,
    done: bool,
}

impl RequestStreamResponder {
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
            responder,
            sender: Some(sender),
            receiver: None,
            holder: FragmentsHolder::new(),
            flow: OutboundFlow::new(initial_request_n),
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
            self.receiver = Some(
                self.responder
                    .request_stream(payload, self.initial_request_n, sender),
            );
        }
    }

    fn cancel_receiver(&mut self) {
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.cancel();
        }
    }

    fn flush(&mut self, ctx: &mut StreamContext<'_>) {
        for (payload, complete) in self.flow.drain() {
            ctx.send_next(self.stream_id, payload, complete);
        }
        if self.flow.is_finished() {
            self.done = true;
        }
    }
}

impl StreamHandler for RequestStreamResponder {
    fn stream_id(&self) -> Option<u32> {
        Some(self.stream_id)
    }

    fn kind(&self) -> &'static str {
        "request_stream responder"
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
            FrameBody::RequestN { request_n } if self.receiver.is_some() => {
                self.flow.grant(request_n);
                self.flush(ctx);
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.request(request_n);
                }
            }
            FrameBody::Cancel | FrameBody::Error { .. } => {
                self.done = true;
                self.holder.cancel();
                self.flow.clear();
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
                let message = if self.receiver.is_none() {
                    format!("unexpected frame {frame_type} during request reassembly")
                } else {
                    format!("unexpected frame {frame_type} on request_stream stream")
                };
                warn!(stream_id = self.stream_id, %frame_type, "protocol violation");
                self.done = true;
                self.holder.cancel();
                self.flow.clear();
                ctx.send_error(self.stream_id, &RSocketError::invalid(message));
                self.cancel_receiver();
            }
        }
    }

    fn handle_signal(&mut self, signal: StreamSignal, ctx: &mut StreamContext<'_>) {
        match signal {
            StreamSignal::Next { .. } | StreamSignal::Complete | StreamSignal::Error(_)
                if self.done || self.flow.is_completing() =>
            {
                warn!(stream_id = self.stream_id, "dropping signal after stream terminated");
            }
            StreamSignal::Next { payload, complete } => {
                self.flow.push(payload, complete);
                self.flush(ctx);
            }
            StreamSignal::Complete => {
                if self.flow.complete() {
                    self.done = true;
                    ctx.send_complete(self.stream_id);
                }
            }
            StreamSignal::Error(error) => {
                self.done = true;
                self.flow.clear();
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
            other => debug!(signal = ?other, "ignoring signal on request_stream responder"),
        }
    }

    fn close(&mut self, _error: Option<RSocketError>) {
        if self.done {
            return;
        }
        self.done = true;
        self.holder.cancel();
        self.flow.clear();
        self.cancel_receiver();
    }

    fn is_terminated(&self) -> bool {
        self.done
    }
}
