//! Outbound payload fragmentation.
//!
//! `max_frame_size` bounds the encoded frame without the transport length
//! prefix: the 6-byte header, the 4-byte initial request N on the first
//! REQUEST_STREAM / REQUEST_CHANNEL fragment, and the 3-byte metadata length
//! when a fragment carries metadata all count against it. A size of 0
//! disables fragmentation.
//!
//! Metadata is emitted before data. A fragment only starts carrying data
//! once all metadata has been sent, so the receiver can reassemble by plain
//! concatenation.

use bytes::Bytes;
use rsocket_protocol::{
    Flags, Frame, FrameType, Payload, FRAME_HEADER_SIZE, METADATA_LENGTH_SIZE, REQUEST_N_SIZE,
};

/// Smallest usable non-zero fragment size.
pub const MIN_FRAGMENT_SIZE: usize = 64;

/// Returns true if `payload` sent as a `frame_type` frame would exceed
/// `max_frame_size` bytes.
pub fn is_fragmentable(payload: &Payload, max_frame_size: usize, frame_type: FrameType) -> bool {
    if max_frame_size == 0 {
        return false;
    }
    let request_n = if frame_type.has_initial_request_n() {
        REQUEST_N_SIZE
    } else {
        0
    };
    let metadata = payload
        .metadata
        .as_ref()
        .map_or(0, |m| METADATA_LENGTH_SIZE + m.len());
    FRAME_HEADER_SIZE + request_n + metadata + payload.data_len() > max_frame_size
}

/// Splits a payload into a chain of frames.
///
/// The first frame has `frame_type`; every following one is a PAYLOAD frame.
/// FOLLOWS is set on all but the last frame, COMPLETE only on the last one
/// when `is_complete` holds, and NEXT on every PAYLOAD frame.
pub fn fragment(
    stream_id: u32,
    payload: Payload,
    max_frame_size: usize,
    frame_type: FrameType,
    is_complete: bool,
) -> Fragments {
    fragment_with_request_n(stream_id, payload, max_frame_size, frame_type, 0, is_complete)
}

/// Like [`fragment`], for a first frame that carries an initial request N.
pub fn fragment_with_request_n(
    stream_id: u32,
    payload: Payload,
    max_frame_size: usize,
    frame_type: FrameType,
    initial_request_n: u32,
    is_complete: bool,
) -> Fragments {
    Fragments {
        stream_id,
        frame_type,
        initial_request_n,
        is_complete,
        max_frame_size: max_frame_size.max(MIN_FRAGMENT_SIZE),
        metadata: payload.metadata,
        data: payload.data,
        first: true,
    }
}

/// Lazy, single-pass sequence of fragment frames.
#[derive(Debug)]
pub struct Fragments {
    stream_id: u32,
    frame_type: FrameType,
    initial_request_n: u32,
    is_complete: bool,
    max_frame_size: usize,
    metadata: Option<Bytes>,
    data: Option<Bytes>,
    first: bool,
}

impl Iterator for Fragments {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if !self.first && self.metadata.is_none() && self.data.is_none() {
            return None;
        }

        let frame_type = if self.first {
            self.frame_type
        } else {
            FrameType::Payload
        };
        let mut budget = self.max_frame_size - FRAME_HEADER_SIZE;
        if frame_type.has_initial_request_n() {
            budget -= REQUEST_N_SIZE;
        }

        let mut metadata = None;
        if let Some(remaining) = self.metadata.as_mut() {
            if budget > METADATA_LENGTH_SIZE {
                budget -= METADATA_LENGTH_SIZE;
                let chunk = remaining.split_to(remaining.len().min(budget));
                budget -= chunk.len();
                metadata = Some(chunk);
                if remaining.is_empty() {
                    self.metadata = None;
                }
            }
        }

        let mut data = None;
        if self.metadata.is_none() {
            if let Some(remaining) = self.data.as_mut() {
                if budget > 0 || remaining.is_empty() {
                    data = Some(remaining.split_to(remaining.len().min(budget)));
                    if remaining.is_empty() {
                        self.data = None;
                    }
                }
            }
        }

        let last = self.metadata.is_none() && self.data.is_none();
        let flags = Flags::NONE
            .with_if(Flags::FOLLOWS, !last)
            .with_if(Flags::COMPLETE, last && self.is_complete)
            .with_if(Flags::NEXT, frame_type == FrameType::Payload);
        let payload = Payload::new(data, metadata);

        let frame = if frame_type == FrameType::Payload {
            Frame::payload(self.stream_id, payload, flags)
        } else {
            Frame::request(
                frame_type,
                self.stream_id,
                payload,
                self.initial_request_n,
                flags,
            )
        };
        self.first = false;
        Some(frame)
    }
}
