//! SETUP frame construction and validation.

use crate::config::ConnectionConfig;
use rsocket_core::RSocketError;
use rsocket_protocol::{
    ErrorCode, Flags, Frame, FrameBody, Payload, Setup, MAJOR_VERSION, MINOR_VERSION,
};
use std::time::Duration;

/// Connection parameters agreed at SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub keepalive_interval: Duration,
    pub max_lifetime: Duration,
    pub lease: bool,
    pub data_mime_type: String,
    pub metadata_mime_type: String,
    /// Payload carried by the SETUP frame.
    pub payload: Payload,
}

/// Builds the SETUP frame a client sends first.
pub fn client_setup(config: &ConnectionConfig, lease: bool, payload: Payload) -> Frame {
    Frame::setup(
        Setup {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            keepalive_ms: config.keepalive_interval_ms,
            max_lifetime_ms: config.max_lifetime_ms,
            resume_token: None,
            metadata_mime_type: config.metadata_mime_type.clone(),
            data_mime_type: config.data_mime_type.clone(),
            payload,
        },
        lease,
    )
}

/// Validates the first frame of a server-side connection.
///
/// The returned error is meant to be sent on stream 0 before the
/// connection is dropped.
pub fn accept_setup(frame: Frame, lease_supported: bool) -> Result<Negotiated, RSocketError> {
    let flags = frame.flags;
    let frame_type = frame.frame_type();
    let FrameBody::Setup(setup) = frame.body else {
        return Err(RSocketError::new(
            ErrorCode::InvalidSetup,
            format!("expected SETUP, got {frame_type}"),
        ));
    };

    if frame.stream_id != 0 {
        return Err(RSocketError::new(
            ErrorCode::InvalidSetup,
            "SETUP must use stream 0",
        ));
    }
    if setup.major_version != MAJOR_VERSION {
        return Err(RSocketError::new(
            ErrorCode::UnsupportedSetup,
            format!(
                "unsupported version {}.{}",
                setup.major_version, setup.minor_version
            ),
        ));
    }
    if flags.contains(Flags::RESUME_ENABLE) || setup.resume_token.is_some() {
        return Err(RSocketError::new(
            ErrorCode::UnsupportedSetup,
            "resumption not supported",
        ));
    }
    if flags.has_lease() && !lease_supported {
        return Err(RSocketError::new(
            ErrorCode::UnsupportedSetup,
            "lease not supported",
        ));
    }
    if setup.keepalive_ms == 0 || setup.max_lifetime_ms == 0 {
        return Err(RSocketError::new(
            ErrorCode::InvalidSetup,
            "keepalive interval and max lifetime must be positive",
        ));
    }

    Ok(Negotiated {
        keepalive_interval: Duration::from_millis(u64::from(setup.keepalive_ms)),
        max_lifetime: Duration::from_millis(u64::from(setup.max_lifetime_ms)),
        lease: flags.has_lease(),
        data_mime_type: setup.data_mime_type,
        metadata_mime_type: setup.metadata_mime_type,
        payload: setup.payload,
    })
}

/// Returns true for the error codes that reject a SETUP.
pub fn is_setup_error(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::InvalidSetup
            | ErrorCode::UnsupportedSetup
            | ErrorCode::RejectedSetup
            | ErrorCode::RejectedResume
    )
}
