//! Star-delimited framing for identity-bearing collector modems.
//!
//! Wire format:
//!
//! ```text
//! '*' | identity (15 ASCII digits) | '*' | code | '*' | len_hi | len_lo | '*' | payload
//! ```
//!
//! Decoding is total: every buffer maps to a [`DecodeOutcome`], nothing
//! panics and nothing is returned as an error. An [`DecodeOutcome::Incomplete`]
//! buffer may be completed by the next read; anything else that is not a
//! frame is for the caller to log and drop.

use crate::error::{GatewayError, GatewayResult};
use thiserror::Error;

/// Frame field delimiter.
pub const DELIMITER: u8 = b'*';

/// Length of the identity field.
pub const IDENTITY_LEN: usize = 15;

/// Bytes from the first delimiter up to the start of the payload.
pub const HEADER_LEN: usize = 22;

/// Function codes carried at offset 17.
pub mod function {
    /// Telemetry from the device, or data pushed down to it.
    pub const FORWARD: u8 = 0x01;
    /// Registration request, answered with [`REGISTER_REPLY`].
    pub const REGISTER: u8 = 0x02;
    pub const REGISTER_REPLY: u8 = 0x03;
    /// Heartbeat request, answered with [`HEARTBEAT_REPLY`].
    pub const HEARTBEAT: u8 = 0x04;
    pub const HEARTBEAT_REPLY: u8 = 0x05;
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub identity: String,
    pub code: u8,
    pub payload: Vec<u8>,
}

/// Why a buffer is not a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Malformed {
    #[error("no delimiter in buffer")]
    NoDelimiter,

    #[error("buffer too short for a frame header")]
    TooShort,

    #[error("identity is not {IDENTITY_LEN} decimal digits")]
    BadIdentity,

    #[error("delimiter missing at a fixed offset")]
    BadFraming,
}

/// Result of decoding one inbound buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Frame(Frame),
    Malformed(Malformed),
    /// The header is valid but the declared payload length exceeds the
    /// bytes that follow it.
    Incomplete { declared: usize, available: usize },
}

/// Encode a frame.
///
/// Fails only when the payload does not fit the 16-bit length field.
pub fn encode_frame(identity: &str, code: u8, payload: &[u8]) -> GatewayResult<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        GatewayError::Codec(format!(
            "payload too large: {} bytes (max {})",
            payload.len(),
            u16::MAX
        ))
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(DELIMITER);
    frame.extend_from_slice(identity.as_bytes());
    frame.push(DELIMITER);
    frame.push(code);
    frame.push(DELIMITER);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(DELIMITER);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode an inbound buffer. Bytes before the first delimiter are skipped.
pub fn decode_frame(buf: &[u8]) -> DecodeOutcome {
    let Some(start) = buf.iter().position(|&b| b == DELIMITER) else {
        return DecodeOutcome::Malformed(Malformed::NoDelimiter);
    };
    if buf.len() < HEADER_LEN || buf.len() - start < HEADER_LEN {
        return DecodeOutcome::Malformed(Malformed::TooShort);
    }

    let header = &buf[start..start + HEADER_LEN];

    let identity = match parse_identity(&header[1..1 + IDENTITY_LEN]) {
        Some(id) => id,
        None => return DecodeOutcome::Malformed(Malformed::BadIdentity),
    };

    if header[16] != DELIMITER || header[18] != DELIMITER {
        return DecodeOutcome::Malformed(Malformed::BadFraming);
    }

    let code = header[17];
    let declared = u16::from_be_bytes([header[19], header[20]]) as usize;
    let body = &buf[start + HEADER_LEN..];

    if declared > body.len() {
        return DecodeOutcome::Incomplete {
            declared,
            available: body.len(),
        };
    }

    let payload = if declared > 0 { body.to_vec() } else { Vec::new() };

    DecodeOutcome::Frame(Frame {
        identity,
        code,
        payload,
    })
}

/// Whether `s` is a well-formed device identity (15 decimal digits).
pub fn is_valid_identity(s: &str) -> bool {
    s.len() == IDENTITY_LEN && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_identity(raw: &[u8]) -> Option<String> {
    if !raw.is_ascii() {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?.trim();
    is_valid_identity(text).then(|| text.to_string())
}
