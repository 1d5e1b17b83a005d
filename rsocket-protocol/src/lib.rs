//! # rsocket-protocol
//!
//! Frame model and wire codec for the RSocket protocol.
//!
//! This crate provides:
//! - Typed frames for every RSocket frame type, with flag predicates
//! - Binary encoding/decoding of individual frames
//! - Length-prefixed framing for byte-stream transports
//! - Wire error codes and protocol constants

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{Decoder, Encoder, FRAME_LENGTH_SIZE};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{
    Flags, Frame, FrameBody, FrameType, Payload, Setup, FRAME_HEADER_SIZE, METADATA_LENGTH_SIZE,
    REQUEST_N_SIZE,
};

/// Protocol major version supported by this implementation.
pub const MAJOR_VERSION: u16 = 1;

/// Protocol minor version supported by this implementation.
pub const MINOR_VERSION: u16 = 0;

/// Default port for RSocket over TCP.
pub const DEFAULT_PORT: u16 = 7878;

/// Largest valid stream ID (31 bits).
pub const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

/// Largest request N on the wire; this value means unbounded demand.
pub const MAX_REQUEST_N: u32 = 0x7FFF_FFFF;

/// Maximum encoded frame length expressible by the 24-bit length prefix.
pub const MAX_FRAME_LENGTH: usize = 0xFF_FFFF;
