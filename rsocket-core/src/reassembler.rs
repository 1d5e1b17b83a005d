//! Inbound fragment reassembly.
//!
//! A stream owns one [`FragmentsHolder`]. It is only touched while a
//! FOLLOWS chain is open: a frame without FOLLOWS and no prior fragments
//! never goes through the holder.

use bytes::{Bytes, BytesMut};
use rsocket_protocol::Payload;

/// Accumulates the fragments of one logical payload.
#[derive(Debug, Default)]
pub struct FragmentsHolder {
    has_fragments: bool,
    data: Option<BytesMut>,
    metadata: Option<BytesMut>,
}

impl FragmentsHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a FOLLOWS chain is open.
    pub fn has_fragments(&self) -> bool {
        self.has_fragments
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.data.as_ref().map_or(0, BytesMut::len) + self.metadata.as_ref().map_or(0, BytesMut::len)
    }

    /// Appends a non-final fragment.
    pub fn add(&mut self, fragment: Payload) {
        self.has_fragments = true;
        append(&mut self.data, fragment.data);
        append(&mut self.metadata, fragment.metadata);
    }

    /// Appends the final fragment and returns the whole payload.
    ///
    /// The holder is empty afterwards and can be reused or dropped.
    pub fn reassemble(&mut self, last: Payload) -> Payload {
        self.add(last);
        let payload = Payload {
            data: self.data.take().map(BytesMut::freeze),
            metadata: self.metadata.take().map(BytesMut::freeze),
        };
        self.has_fragments = false;
        payload
    }

    /// Drops any buffered fragments without producing a payload.
    pub fn cancel(&mut self) {
        self.has_fragments = false;
        self.data = None;
        self.metadata = None;
    }
}

fn append(buffer: &mut Option<BytesMut>, chunk: Option<Bytes>) {
    if let Some(chunk) = chunk {
        buffer
            .get_or_insert_with(|| BytesMut::with_capacity(chunk.len()))
            .extend_from_slice(&chunk);
    }
}
