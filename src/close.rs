//! Close-status payloads and classification
//!
//! A close payload is an optional 2-byte big-endian status code followed by
//! an optional UTF-8 reason, at most 125 bytes in total. Codes 1005, 1006
//! and 1015 are defined but must never appear on the wire.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::MAX_CONTROL_PAYLOAD;

/// Close status code plus optional reason text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away
    pub const AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status present (reserved, never transmitted)
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close handshake (reserved, never transmitted)
    pub const CONNECTION_LOST: u16 = 1006;
    /// Payload inconsistent with the message type or negotiated extensions
    pub const INCORRECT_DATA: u16 = 1007;
    /// Policy violation
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Abnormal condition on the endpoint
    pub const ABNORMAL: u16 = 1011;
    /// TLS handshake failure (reserved, never transmitted)
    pub const TLS_FAILURE: u16 = 1015;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check whether a status code may be carried in a close frame
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Codes that are defined but not transmittable on the wire.
#[inline]
pub fn is_reserved(code: u16) -> bool {
    matches!(
        code,
        CloseReason::NO_STATUS | CloseReason::CONNECTION_LOST | CloseReason::TLS_FAILURE
    )
}

/// Control frame payloads are limited to 125 bytes.
#[inline]
pub fn is_valid_control_data(data: &[u8]) -> bool {
    data.len() <= MAX_CONTROL_PAYLOAD
}

/// Build a close frame payload: 2-byte big-endian code followed by the
/// UTF-8 reason. Fails when the total would exceed 125 bytes; nothing is
/// sent in that case.
pub fn build_close_payload(code: u16, reason: &str) -> Result<Bytes> {
    if 2 + reason.len() > MAX_CONTROL_PAYLOAD {
        return Err(Error::ControlTooLarge);
    }
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.put_slice(reason.as_bytes());
    Ok(payload.freeze())
}

/// Parse an inbound close frame payload.
///
/// An empty payload carries no status; a 1-byte payload is a protocol
/// error; otherwise the code must be transmittable (or one of the reserved
/// codes, which the caller elides the reply for) and the reason valid UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.len() == 1 {
        return Err(Error::Protocol("close payload of one byte"));
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !is_reserved(code) && !CloseReason::is_valid_code(code) {
        return Err(Error::InvalidCloseCode(code));
    }

    let reason = if payload.len() > 2 {
        let text = &payload[2..];
        if simdutf8::basic::from_utf8(text).is_err() {
            return Err(Error::InvalidUtf8);
        }
        String::from_utf8_lossy(text).into_owned()
    } else {
        String::new()
    };

    Ok(Some(CloseReason::new(code, reason)))
}
