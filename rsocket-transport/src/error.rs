//! Transport error types.

use crate::config::ConfigError;
use rsocket_core::RSocketError;
use rsocket_protocol::ErrorCode;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rsocket_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stream or connection was terminated with an RSocket error.
    #[error("{0}")]
    Stream(#[from] RSocketError),

    #[error("setup rejected: {code} - {message}")]
    SetupRejected { code: ErrorCode, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("server shutting down")]
    ShuttingDown,
}

impl TransportError {
    /// Returns the RSocket error code that best describes this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransportError::Stream(err) => err.code,
            TransportError::SetupRejected { code, .. } => *code,
            TransportError::Protocol(_) => ErrorCode::ConnectionError,
            TransportError::Io(_) | TransportError::ConnectionClosed => ErrorCode::ConnectionClose,
            TransportError::Timeout => ErrorCode::ConnectionError,
            TransportError::Config(_) => ErrorCode::InvalidSetup,
            TransportError::ShuttingDown => ErrorCode::ConnectionClose,
        }
    }

    /// Returns whether retrying on a fresh connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Io(_) | TransportError::Timeout | TransportError::ConnectionClosed => {
                true
            }
            TransportError::Stream(err) => err.code == ErrorCode::Rejected,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_keeps_code() {
        let err: TransportError = RSocketError::rejected("busy").into();
        assert_eq!(err.error_code(), ErrorCode::Rejected);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "REJECTED: busy");
    }

    #[test]
    fn test_setup_rejection_not_retryable() {
        let err = TransportError::SetupRejected {
            code: ErrorCode::UnsupportedSetup,
            message: "version 2.0".to_string(),
        };
        assert_eq!(err.error_code(), ErrorCode::UnsupportedSetup);
        assert!(!err.is_retryable());
    }
}
