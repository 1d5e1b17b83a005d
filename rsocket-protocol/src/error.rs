//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("unknown frame type: {0:#x}")]
    UnknownFrameType(u8),

    #[error("invalid stream id: {0:#x}")]
    InvalidStreamId(u32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("metadata too large: {0} bytes")]
    MetadataTooLarge(usize),

    #[error("MIME type too long: {0} bytes")]
    MimeTypeTooLong(usize),

    #[error("resume token too long: {0} bytes")]
    ResumeTokenTooLong(usize),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error codes carried by ERROR frames.
///
/// Codes in the connection range terminate the whole connection and are only
/// valid on stream 0; the others terminate a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Connection errors
    InvalidSetup,
    UnsupportedSetup,
    RejectedSetup,
    RejectedResume,
    ConnectionError,
    ConnectionClose,

    // Stream errors
    ApplicationError,
    Rejected,
    Canceled,
    Invalid,

    /// Application-defined code, propagated unchanged.
    Custom(u32),
}

impl ErrorCode {
    /// Maps a wire value to an error code.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0000_0001 => ErrorCode::InvalidSetup,
            0x0000_0002 => ErrorCode::UnsupportedSetup,
            0x0000_0003 => ErrorCode::RejectedSetup,
            0x0000_0004 => ErrorCode::RejectedResume,
            0x0000_0101 => ErrorCode::ConnectionError,
            0x0000_0102 => ErrorCode::ConnectionClose,
            0x0000_0201 => ErrorCode::ApplicationError,
            0x0000_0202 => ErrorCode::Rejected,
            0x0000_0203 => ErrorCode::Canceled,
            0x0000_0204 => ErrorCode::Invalid,
            other => ErrorCode::Custom(other),
        }
    }

    /// Returns the wire value of this code.
    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::InvalidSetup => 0x0000_0001,
            ErrorCode::UnsupportedSetup => 0x0000_0002,
            ErrorCode::RejectedSetup => 0x0000_0003,
            ErrorCode::RejectedResume => 0x0000_0004,
            ErrorCode::ConnectionError => 0x0000_0101,
            ErrorCode::ConnectionClose => 0x0000_0102,
            ErrorCode::ApplicationError => 0x0000_0201,
            ErrorCode::Rejected => 0x0000_0202,
            ErrorCode::Canceled => 0x0000_0203,
            ErrorCode::Invalid => 0x0000_0204,
            ErrorCode::Custom(code) => *code,
        }
    }

    /// Returns whether this code terminates the connection rather than a stream.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidSetup
                | ErrorCode::UnsupportedSetup
                | ErrorCode::RejectedSetup
                | ErrorCode::RejectedResume
                | ErrorCode::ConnectionError
                | ErrorCode::ConnectionClose
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidSetup => write!(f, "INVALID_SETUP"),
            ErrorCode::UnsupportedSetup => write!(f, "UNSUPPORTED_SETUP"),
            ErrorCode::RejectedSetup => write!(f, "REJECTED_SETUP"),
            ErrorCode::RejectedResume => write!(f, "REJECTED_RESUME"),
            ErrorCode::ConnectionError => write!(f, "CONNECTION_ERROR"),
            ErrorCode::ConnectionClose => write!(f, "CONNECTION_CLOSE"),
            ErrorCode::ApplicationError => write!(f, "APPLICATION_ERROR"),
            ErrorCode::Rejected => write!(f, "REJECTED"),
            ErrorCode::Canceled => write!(f, "CANCELED"),
            ErrorCode::Invalid => write!(f, "INVALID"),
            ErrorCode::Custom(code) => write!(f, "CUSTOM({code:#x})"),
        }
    }
}
