//! JSON encoding/decoding of a single envelope body.
//!
//! ```text
//! { "kind": "chat", "id": "c-1", "userID": "u1",
//!   "payload": { ... }, "timestamp": "2024-01-01T00:00:00Z" }
//! ```
//!
//! This module knows nothing about framing; `frame_codec` and
//! `line_codec` wrap these bodies for a byte stream.

use hub_core::Envelope;
use thiserror::Error;

use crate::wire_types::MAX_FRAME_LEN;

/// Errors that can arise when encoding/decoding a frame.
///
/// Every decode error is terminal for the connection it came from.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame larger than [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds limit of {max}", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    /// Zero-length frame or blank body where an envelope was expected.
    #[error("empty frame")]
    EmptyFrame,

    /// Body is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Body is not a well-formed envelope (bad JSON, empty kind, ...).
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
}

/// Serialize an envelope body.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    Ok(body)
}

/// Parse an envelope body.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, ProtocolError> {
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }

    Ok(serde_json::from_str(text)?)
}
