//! Stream and connection error type.

use rsocket_protocol::{ErrorCode, Frame, FrameBody};
use thiserror::Error;

/// An error that crosses the wire as an ERROR frame, or is delivered to the
/// application as a terminal signal.
///
/// The code and message are propagated unchanged between ERROR frames and
/// local error values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RSocketError {
    pub code: ErrorCode,
    pub message: String,
}

impl RSocketError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Protocol violation on a stream.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    /// Explicit cancellation.
    pub fn canceled() -> Self {
        Self::new(ErrorCode::Canceled, "Cancelled")
    }

    /// Handler failure not otherwise typed.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApplicationError, message)
    }

    /// Request refused before any application processing.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Rejected, message)
    }

    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionError, message)
    }

    pub fn connection_close(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionClose, message)
    }

    /// Translates an application failure into a wire error.
    ///
    /// A failure that already is an `RSocketError` keeps its code; anything
    /// else becomes `APPLICATION_ERROR` with the failure's display text.
    pub fn from_failure(err: &(dyn std::error::Error + 'static)) -> Self {
        match err.downcast_ref::<RSocketError>() {
            Some(e) => e.clone(),
            None => Self::application(err.to_string()),
        }
    }

    /// Extracts the error carried by an ERROR frame.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        match &frame.body {
            FrameBody::Error { code, message } => Some(Self::new(*code, message.clone())),
            _ => None,
        }
    }

    /// Builds the ERROR frame announcing this error on `stream_id`.
    pub fn to_frame(&self, stream_id: u32) -> Frame {
        Frame::error(stream_id, self.code, self.message.clone())
    }

    pub fn is_connection_error(&self) -> bool {
        self.code.is_connection_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion_preserves_code() {
        let err = RSocketError::new(ErrorCode::Custom(0x301), "teapot");
        let frame = err.to_frame(5);
        assert_eq!(frame.stream_id, 5);
        assert_eq!(RSocketError::from_frame(&frame), Some(err));
    }

    #[test]
    fn test_from_failure_keeps_typed_code() {
        let typed = RSocketError::rejected("busy");
        assert_eq!(RSocketError::from_failure(&typed), typed);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let mapped = RSocketError::from_failure(&io);
        assert_eq!(mapped.code, ErrorCode::ApplicationError);
        assert_eq!(mapped.message, "disk on fire");
    }

    #[test]
    fn test_display() {
        let err = RSocketError::invalid("bad frame");
        assert_eq!(err.to_string(), "INVALID: bad frame");
        assert!(!err.is_connection_error());
        assert!(RSocketError::connection_close("bye").is_connection_error());
    }
}
