//! Length-prefixed framing for byte-stream transports.
//!
//! Each frame is preceded by a 24-bit big-endian length that counts the
//! frame bytes only:
//!
//! ```text
//! +------------+---------------------------+
//! | length(3)  | frame (length bytes)      |
//! +------------+---------------------------+
//! ```

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::MAX_FRAME_LENGTH;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the transport length prefix in bytes.
pub const FRAME_LENGTH_SIZE: usize = 3;

/// Encodes frames with a length prefix.
pub struct Encoder;

impl Encoder {
    /// Encodes a frame into a new buffer.
    pub fn encode_frame(frame: &Frame) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(FRAME_LENGTH_SIZE + frame.encoded_len());
        Self::encode_into(frame, &mut buf)?;
        Ok(buf)
    }

    /// Appends a length-prefixed frame to `buf`.
    pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = frame.encoded_len();
        if len > MAX_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_LENGTH,
            });
        }
        buf.put_uint(len as u64, FRAME_LENGTH_SIZE);
        frame.encode(buf)
    }
}

/// Decodes length-prefixed frames from a growing buffer.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_length: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    /// Rejects frames longer than `max` bytes.
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max.min(MAX_FRAME_LENGTH);
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buffer.len() < FRAME_LENGTH_SIZE {
            return Ok(None);
        }

        let len = (usize::from(self.buffer[0]) << 16)
            | (usize::from(self.buffer[1]) << 8)
            | usize::from(self.buffer[2]);
        if len > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_length,
            });
        }

        if self.buffer.len() < FRAME_LENGTH_SIZE + len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_LENGTH_SIZE);
        let raw = self.buffer.split_to(len).freeze();
        Frame::decode(raw).map(Some)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Flags, FrameType, Payload};

    #[test]
    fn test_encoder_decoder_roundtrip() {
        let frame = Frame::request(
            FrameType::RequestStream,
            1,
            Payload::from_data("ping"),
            8,
            Flags::NONE,
        );
        let encoded = Encoder::encode_frame(&frame).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);

        let decoded = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_decoding() {
        let frame = Frame::payload(3, Payload::from_data("hello world"), Flags::NEXT);
        let encoded = Encoder::encode_frame(&frame).unwrap();

        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..2]);
        assert!(decoder.decode_frame().unwrap().is_none());

        decoder.extend(&encoded[2..10]);
        assert!(decoder.decode_frame().unwrap().is_none());

        decoder.extend(&encoded[10..]);
        let decoded = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(decoded.into_payload().data_utf8(), Some("hello world"));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        Encoder::encode_into(&Frame::request_n(1, 5), &mut buf).unwrap();
        Encoder::encode_into(&Frame::cancel(1), &mut buf).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend_bytes(buf.freeze());

        let first = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(first.frame_type(), FrameType::RequestN);

        let second = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(second.frame_type(), FrameType::Cancel);

        assert!(decoder.decode_frame().unwrap().is_none());
    }

    #[test]
    fn test_length_prefix() {
        let frame = Frame::cancel(9);
        let encoded = Encoder::encode_frame(&frame).unwrap();
        assert_eq!(&encoded[..3], &[0, 0, 6]);
        assert_eq!(encoded.len(), 9);
    }

    #[test]
    fn test_frame_too_large_for_decoder() {
        let frame = Frame::payload(1, Payload::from_data(vec![0u8; 128]), Flags::NEXT);
        let encoded = Encoder::encode_frame(&frame).unwrap();

        let mut decoder = Decoder::new().with_max_frame_length(64);
        decoder.extend(&encoded);
        assert!(matches!(
            decoder.decode_frame(),
            Err(ProtocolError::FrameTooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = Decoder::default();
        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);

        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }
}
