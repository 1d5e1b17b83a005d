//! Typed RSocket frames.
//!
//! Frame layout (without the transport length prefix):
//!
//! ```text
//! +-----------+------------------+-----------------------------+
//! | stream_id | type(6)|flags(10)| type-specific fields        |
//! |  4 bytes  |     2 bytes      | [metadata_len(3)] metadata  |
//! |           |                  | data                        |
//! +-----------+------------------+-----------------------------+
//! ```
//!
//! The high bit of `stream_id` is reserved and must be zero. Stream 0 carries
//! connection-level frames (SETUP, LEASE, KEEPALIVE, METADATA_PUSH and
//! connection errors).

use crate::error::{ErrorCode, ProtocolError};
use crate::MAX_STREAM_ID;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Size of the fixed frame header in bytes (stream id + type/flags).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Size of the metadata length prefix in bytes.
pub const METADATA_LENGTH_SIZE: usize = 3;

/// Size of the initial request N field of REQUEST_STREAM / REQUEST_CHANNEL.
pub const REQUEST_N_SIZE: usize = 4;

const MAX_METADATA_LENGTH: usize = 0xFF_FFFF;
const FLAGS_MASK: u16 = 0x03FF;
const TYPE_SHIFT: u16 = 10;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Setup = 0x01,
    Lease = 0x02,
    Keepalive = 0x03,
    RequestResponse = 0x04,
    RequestFnf = 0x05,
    RequestStream = 0x06,
    RequestChannel = 0x07,
    RequestN = 0x08,
    Cancel = 0x09,
    Payload = 0x0A,
    Error = 0x0B,
    MetadataPush = 0x0C,
    Ext = 0x3F,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::Keepalive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => FrameType::Payload,
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x3F => FrameType::Ext,
            other => return Err(ProtocolError::UnknownFrameType(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for the four frame types that open a new stream.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }

    /// Returns true if the first frame of this type carries an initial request N.
    pub fn has_initial_request_n(self) -> bool {
        matches!(self, FrameType::RequestStream | FrameType::RequestChannel)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Setup => "SETUP",
            FrameType::Lease => "LEASE",
            FrameType::Keepalive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::MetadataPush => "METADATA_PUSH",
            FrameType::Ext => "EXT",
        };
        f.write_str(name)
    }
}

/// Frame flags bitfield (10 bits).
///
/// Some bits are reused with a type-specific meaning: on SETUP `0x80` is
/// RESUME_ENABLE and `0x40` is LEASE, on KEEPALIVE `0x80` is RESPOND.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Frame can be ignored if not understood.
    pub const IGNORE: Flags = Flags(0x200);
    /// Metadata is present.
    pub const METADATA: Flags = Flags(0x100);
    /// More fragments follow this one.
    pub const FOLLOWS: Flags = Flags(0x80);
    /// Stream completion.
    pub const COMPLETE: Flags = Flags(0x40);
    /// Payload carries a next item.
    pub const NEXT: Flags = Flags(0x20);
    /// SETUP: client requests resume support.
    pub const RESUME_ENABLE: Flags = Flags(0x80);
    /// SETUP: client will honor LEASE.
    pub const LEASE: Flags = Flags(0x40);
    /// KEEPALIVE: peer must respond.
    pub const RESPOND: Flags = Flags(0x80);

    pub fn from_bits_truncate(bits: u16) -> Self {
        Self(bits & FLAGS_MASK)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Sets `other` when `condition` holds.
    pub fn with_if(mut self, other: Flags, condition: bool) -> Self {
        if condition {
            self.insert(other);
        }
        self
    }

    pub fn has_ignore(&self) -> bool {
        self.contains(Self::IGNORE)
    }

    pub fn has_metadata(&self) -> bool {
        self.contains(Self::METADATA)
    }

    pub fn has_follows(&self) -> bool {
        self.contains(Self::FOLLOWS)
    }

    pub fn has_complete(&self) -> bool {
        self.contains(Self::COMPLETE)
    }

    pub fn has_next(&self) -> bool {
        self.contains(Self::NEXT)
    }

    pub fn has_lease(&self) -> bool {
        self.contains(Self::LEASE)
    }

    pub fn has_respond(&self) -> bool {
        self.contains(Self::RESPOND)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Application-visible unit of data: optional data plus optional metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub data: Option<Bytes>,
    pub metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: Option<Bytes>, metadata: Option<Bytes>) -> Self {
        Self { data, metadata }
    }

    /// Creates a payload with data and no metadata.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    pub fn metadata_len(&self) -> usize {
        self.metadata.as_ref().map_or(0, Bytes::len)
    }

    /// Returns the data as UTF-8, if present and valid.
    pub fn data_utf8(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| std::str::from_utf8(d).ok())
    }
}

/// SETUP frame fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setup {
    pub major_version: u16,
    pub minor_version: u16,
    /// Interval between client KEEPALIVE frames, in milliseconds.
    pub keepalive_ms: u32,
    /// Time without any KEEPALIVE after which the connection is dead, in milliseconds.
    pub max_lifetime_ms: u32,
    pub resume_token: Option<Bytes>,
    pub metadata_mime_type: String,
    pub data_mime_type: String,
    pub payload: Payload,
}

/// Type-specific frame content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Setup(Setup),
    Lease {
        ttl_ms: u32,
        request_count: u32,
        metadata: Option<Bytes>,
    },
    Keepalive {
        last_received_position: u64,
        data: Bytes,
    },
    RequestResponse(Payload),
    RequestFnf(Payload),
    RequestStream {
        initial_request_n: u32,
        payload: Payload,
    },
    RequestChannel {
        initial_request_n: u32,
        payload: Payload,
    },
    RequestN {
        request_n: u32,
    },
    Cancel,
    Payload(Payload),
    Error {
        code: ErrorCode,
        message: String,
    },
    MetadataPush {
        metadata: Bytes,
    },
    Ext {
        extended_type: u32,
        content: Bytes,
    },
}

/// A single RSocket frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub flags: Flags,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(stream_id: u32, flags: Flags, body: FrameBody) -> Self {
        Self {
            stream_id,
            flags,
            body,
        }
    }

    /// Builds a request-initiating frame of `frame_type`.
    ///
    /// `initial_request_n` is only meaningful for REQUEST_STREAM and
    /// REQUEST_CHANNEL; other request types ignore it.
    pub fn request(
        frame_type: FrameType,
        stream_id: u32,
        payload: Payload,
        initial_request_n: u32,
        flags: Flags,
    ) -> Self {
        let body = match frame_type {
            FrameType::RequestResponse => FrameBody::RequestResponse(payload),
            FrameType::RequestFnf => FrameBody::RequestFnf(payload),
            FrameType::RequestStream => FrameBody::RequestStream {
                initial_request_n,
                payload,
            },
            FrameType::RequestChannel => FrameBody::RequestChannel {
                initial_request_n,
                payload,
            },
            _ => FrameBody::Payload(payload),
        };
        Self::new(stream_id, flags, body).normalized()
    }

    /// Builds a PAYLOAD frame; METADATA is derived from the payload.
    pub fn payload(stream_id: u32, payload: Payload, flags: Flags) -> Self {
        Self::new(stream_id, flags, FrameBody::Payload(payload)).normalized()
    }

    /// Builds a PAYLOAD frame carrying only COMPLETE.
    pub fn complete(stream_id: u32) -> Self {
        Self::new(
            stream_id,
            Flags::COMPLETE,
            FrameBody::Payload(Payload::default()),
        )
    }

    pub fn request_n(stream_id: u32, request_n: u32) -> Self {
        Self::new(stream_id, Flags::NONE, FrameBody::RequestN { request_n })
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self::new(stream_id, Flags::NONE, FrameBody::Cancel)
    }

    pub fn error(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            stream_id,
            Flags::NONE,
            FrameBody::Error {
                code,
                message: message.into(),
            },
        )
    }

    pub fn ext(stream_id: u32, extended_type: u32, content: Bytes, can_be_ignored: bool) -> Self {
        Self::new(
            stream_id,
            Flags::NONE.with_if(Flags::IGNORE, can_be_ignored),
            FrameBody::Ext {
                extended_type,
                content,
            },
        )
    }

    pub fn keepalive(last_received_position: u64, data: Bytes, respond: bool) -> Self {
        Self::new(
            0,
            Flags::NONE.with_if(Flags::RESPOND, respond),
            FrameBody::Keepalive {
                last_received_position,
                data,
            },
        )
    }

    pub fn lease(ttl_ms: u32, request_count: u32, metadata: Option<Bytes>) -> Self {
        Self::new(
            0,
            Flags::NONE,
            FrameBody::Lease {
                ttl_ms,
                request_count,
                metadata,
            },
        )
        .normalized()
    }

    pub fn metadata_push(metadata: Bytes) -> Self {
        Self::new(0, Flags::METADATA, FrameBody::MetadataPush { metadata })
    }

    pub fn setup(setup: Setup, lease: bool) -> Self {
        let flags = Flags::NONE
            .with_if(Flags::LEASE, lease)
            .with_if(Flags::RESUME_ENABLE, setup.resume_token.is_some());
        Self::new(0, flags, FrameBody::Setup(setup)).normalized()
    }

    /// Returns the frame type of this frame.
    pub fn frame_type(&self) -> FrameType {
        match &self.body {
            FrameBody::Setup(_) => FrameType::Setup,
            FrameBody::Lease { .. } => FrameType::Lease,
            FrameBody::Keepalive { .. } => FrameType::Keepalive,
            FrameBody::RequestResponse(_) => FrameType::RequestResponse,
            FrameBody::RequestFnf(_) => FrameType::RequestFnf,
            FrameBody::RequestStream { .. } => FrameType::RequestStream,
            FrameBody::RequestChannel { .. } => FrameType::RequestChannel,
            FrameBody::RequestN { .. } => FrameType::RequestN,
            FrameBody::Cancel => FrameType::Cancel,
            FrameBody::Payload(_) => FrameType::Payload,
            FrameBody::Error { .. } => FrameType::Error,
            FrameBody::MetadataPush { .. } => FrameType::MetadataPush,
            FrameBody::Ext { .. } => FrameType::Ext,
        }
    }

    /// Returns the payload carried by this frame, if its type carries one.
    pub fn payload_ref(&self) -> Option<&Payload> {
        match &self.body {
            FrameBody::Setup(setup) => Some(&setup.payload),
            FrameBody::RequestResponse(p)
            | FrameBody::RequestFnf(p)
            | FrameBody::Payload(p)
            | FrameBody::RequestStream { payload: p, .. }
            | FrameBody::RequestChannel { payload: p, .. } => Some(p),
            _ => None,
        }
    }

    /// Consumes the frame and returns its payload (empty if the type carries none).
    pub fn into_payload(self) -> Payload {
        match self.body {
            FrameBody::Setup(setup) => setup.payload,
            FrameBody::RequestResponse(p)
            | FrameBody::RequestFnf(p)
            | FrameBody::Payload(p)
            | FrameBody::RequestStream { payload: p, .. }
            | FrameBody::RequestChannel { payload: p, .. } => p,
            _ => Payload::default(),
        }
    }

    /// Returns the number of bytes this frame occupies on the wire,
    /// excluding the transport length prefix.
    pub fn encoded_len(&self) -> usize {
        let payload_len = |p: &Payload| {
            p.data_len()
                + p.metadata
                    .as_ref()
                    .map_or(0, |m| METADATA_LENGTH_SIZE + m.len())
        };
        FRAME_HEADER_SIZE
            + match &self.body {
                FrameBody::Setup(s) => {
                    12 + s.resume_token.as_ref().map_or(0, |t| 2 + t.len())
                        + 2
                        + s.metadata_mime_type.len()
                        + s.data_mime_type.len()
                        + payload_len(&s.payload)
                }
                FrameBody::Lease { metadata, .. } => 8 + metadata.as_ref().map_or(0, Bytes::len),
                FrameBody::Keepalive { data, .. } => 8 + data.len(),
                FrameBody::RequestResponse(p) | FrameBody::RequestFnf(p) | FrameBody::Payload(p) => {
                    payload_len(p)
                }
                FrameBody::RequestStream { payload, .. }
                | FrameBody::RequestChannel { payload, .. } => REQUEST_N_SIZE + payload_len(payload),
                FrameBody::RequestN { .. } => 4,
                FrameBody::Cancel => 0,
                FrameBody::Error { message, .. } => 4 + message.len(),
                FrameBody::MetadataPush { metadata } => metadata.len(),
                FrameBody::Ext { content, .. } => 4 + content.len(),
            }
    }

    /// Returns the flags with METADATA set or cleared to match the body.
    fn wire_flags(&self) -> Flags {
        let has_metadata = match &self.body {
            FrameBody::Lease { metadata, .. } => metadata.is_some(),
            FrameBody::MetadataPush { .. } => true,
            _ => match self.payload_ref() {
                Some(p) => p.metadata.is_some(),
                None => return self.flags,
            },
        };
        let mut flags = self.flags;
        if has_metadata {
            flags.insert(Flags::METADATA);
        } else {
            flags.remove(Flags::METADATA);
        }
        flags
    }

    fn normalized(mut self) -> Self {
        self.flags = self.wire_flags();
        self
    }

    /// Encodes the frame into `buf` (without the transport length prefix).
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.stream_id > MAX_STREAM_ID {
            return Err(ProtocolError::InvalidStreamId(self.stream_id));
        }
        buf.reserve(self.encoded_len());

        buf.put_u32(self.stream_id);
        buf.put_u16((u16::from(self.frame_type().as_u8()) << TYPE_SHIFT) | self.wire_flags().bits());

        match &self.body {
            FrameBody::Setup(setup) => {
                buf.put_u16(setup.major_version);
                buf.put_u16(setup.minor_version);
                buf.put_u32(setup.keepalive_ms);
                buf.put_u32(setup.max_lifetime_ms);
                if let Some(token) = &setup.resume_token {
                    let len = u16::try_from(token.len())
                        .map_err(|_| ProtocolError::ResumeTokenTooLong(token.len()))?;
                    buf.put_u16(len);
                    buf.put_slice(token);
                }
                put_mime_type(buf, &setup.metadata_mime_type)?;
                put_mime_type(buf, &setup.data_mime_type)?;
                put_payload(buf, &setup.payload)?;
            }
            FrameBody::Lease {
                ttl_ms,
                request_count,
                metadata,
            } => {
                buf.put_u32(*ttl_ms);
                buf.put_u32(*request_count);
                if let Some(metadata) = metadata {
                    buf.put_slice(metadata);
                }
            }
            FrameBody::Keepalive {
                last_received_position,
                data,
            } => {
                buf.put_u64(*last_received_position);
                buf.put_slice(data);
            }
            FrameBody::RequestResponse(p) | FrameBody::RequestFnf(p) | FrameBody::Payload(p) => {
                put_payload(buf, p)?;
            }
            FrameBody::RequestStream {
                initial_request_n,
                payload,
            }
            | FrameBody::RequestChannel {
                initial_request_n,
                payload,
            } => {
                buf.put_u32(*initial_request_n);
                put_payload(buf, payload)?;
            }
            FrameBody::RequestN { request_n } => buf.put_u32(*request_n),
            FrameBody::Cancel => {}
            FrameBody::Error { code, message } => {
                buf.put_u32(code.as_u32());
                buf.put_slice(message.as_bytes());
            }
            FrameBody::MetadataPush { metadata } => buf.put_slice(metadata),
            FrameBody::Ext {
                extended_type,
                content,
            } => {
                buf.put_u32(*extended_type);
                buf.put_slice(content);
            }
        }

        Ok(())
    }

    /// Decodes a single frame occupying all of `buf`.
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        ensure(&buf, FRAME_HEADER_SIZE)?;

        let stream_id = buf.get_u32();
        if stream_id > MAX_STREAM_ID {
            return Err(ProtocolError::InvalidStreamId(stream_id));
        }

        let type_and_flags = buf.get_u16();
        let frame_type = FrameType::from_u8((type_and_flags >> TYPE_SHIFT) as u8)?;
        let flags = Flags::from_bits_truncate(type_and_flags);

        let body = match frame_type {
            FrameType::Setup => {
                ensure(&buf, 12)?;
                let major_version = buf.get_u16();
                let minor_version = buf.get_u16();
                let keepalive_ms = buf.get_u32();
                let max_lifetime_ms = buf.get_u32();
                let resume_token = if flags.contains(Flags::RESUME_ENABLE) {
                    ensure(&buf, 2)?;
                    let len = buf.get_u16() as usize;
                    ensure(&buf, len)?;
                    Some(buf.split_to(len))
                } else {
                    None
                };
                let metadata_mime_type = get_mime_type(&mut buf)?;
                let data_mime_type = get_mime_type(&mut buf)?;
                let payload = get_payload(&mut buf, flags)?;
                FrameBody::Setup(Setup {
                    major_version,
                    minor_version,
                    keepalive_ms,
                    max_lifetime_ms,
                    resume_token,
                    metadata_mime_type,
                    data_mime_type,
                    payload,
                })
            }
            FrameType::Lease => {
                ensure(&buf, 8)?;
                let ttl_ms = buf.get_u32();
                let request_count = buf.get_u32();
                let metadata = flags.has_metadata().then_some(buf);
                FrameBody::Lease {
                    ttl_ms,
                    request_count,
                    metadata,
                }
            }
            FrameType::Keepalive => {
                ensure(&buf, 8)?;
                let last_received_position = buf.get_u64();
                FrameBody::Keepalive {
                    last_received_position,
                    data: buf,
                }
            }
            FrameType::RequestResponse => FrameBody::RequestResponse(get_payload(&mut buf, flags)?),
            FrameType::RequestFnf => FrameBody::RequestFnf(get_payload(&mut buf, flags)?),
            FrameType::RequestStream => {
                ensure(&buf, REQUEST_N_SIZE)?;
                let initial_request_n = buf.get_u32();
                FrameBody::RequestStream {
                    initial_request_n,
                    payload: get_payload(&mut buf, flags)?,
                }
            }
            FrameType::RequestChannel => {
                ensure(&buf, REQUEST_N_SIZE)?;
                let initial_request_n = buf.get_u32();
                FrameBody::RequestChannel {
                    initial_request_n,
                    payload: get_payload(&mut buf, flags)?,
                }
            }
            FrameType::RequestN => {
                ensure(&buf, 4)?;
                FrameBody::RequestN {
                    request_n: buf.get_u32(),
                }
            }
            FrameType::Cancel => FrameBody::Cancel,
            FrameType::Payload => FrameBody::Payload(get_payload(&mut buf, flags)?),
            FrameType::Error => {
                ensure(&buf, 4)?;
                let code = ErrorCode::from_u32(buf.get_u32());
                let message = String::from_utf8(buf.to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("error message"))?;
                FrameBody::Error { code, message }
            }
            FrameType::MetadataPush => FrameBody::MetadataPush { metadata: buf },
            FrameType::Ext => {
                ensure(&buf, 4)?;
                let extended_type = buf.get_u32();
                FrameBody::Ext {
                    extended_type,
                    content: buf,
                }
            }
        };

        Ok(Self {
            stream_id,
            flags,
            body,
        })
    }
}

fn ensure(buf: &Bytes, len: usize) -> Result<(), ProtocolError> {
    if buf.len() < len {
        return Err(ProtocolError::IncompleteFrame {
            needed: len - buf.len(),
        });
    }
    Ok(())
}

fn put_mime_type(buf: &mut BytesMut, mime_type: &str) -> Result<(), ProtocolError> {
    let len =
        u8::try_from(mime_type.len()).map_err(|_| ProtocolError::MimeTypeTooLong(mime_type.len()))?;
    buf.put_u8(len);
    buf.put_slice(mime_type.as_bytes());
    Ok(())
}

fn get_mime_type(buf: &mut Bytes) -> Result<String, ProtocolError> {
    ensure(buf, 1)?;
    let len = buf.get_u8() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("MIME type"))
}

fn put_payload(buf: &mut BytesMut, payload: &Payload) -> Result<(), ProtocolError> {
    if let Some(metadata) = &payload.metadata {
        if metadata.len() > MAX_METADATA_LENGTH {
            return Err(ProtocolError::MetadataTooLarge(metadata.len()));
        }
        buf.put_uint(metadata.len() as u64, METADATA_LENGTH_SIZE);
        buf.put_slice(metadata);
    }
    if let Some(data) = &payload.data {
        buf.put_slice(data);
    }
    Ok(())
}

fn get_payload(buf: &mut Bytes, flags: Flags) -> Result<Payload, ProtocolError> {
    let metadata = if flags.has_metadata() {
        ensure(buf, METADATA_LENGTH_SIZE)?;
        let len = buf.get_uint(METADATA_LENGTH_SIZE) as usize;
        ensure(buf, len)?;
        Some(buf.split_to(len))
    } else {
        None
    };
    let data = if buf.has_remaining() {
        Some(std::mem::take(buf))
    } else {
        None
    };
    Ok(Payload { data, metadata })
}
