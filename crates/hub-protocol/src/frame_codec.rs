//! Length-prefixed framing.
//!
//! ```text
//! [0..4] : body length (u32 BE, 1..=MAX_FRAME_LEN)
//! [4..]  : JSON envelope body
//! ```

use bytes::{Buf, BufMut, BytesMut};
use hub_core::Envelope;

use crate::json_codec::{decode_envelope, encode_envelope, ProtocolError};
use crate::wire_types::{LENGTH_PREFIX_LEN, MAX_FRAME_LEN};

/// Append one length-prefixed frame to `dst`.
pub fn encode(envelope: &Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = encode_envelope(envelope)?;

    dst.reserve(LENGTH_PREFIX_LEN + body.len());
    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(&body);
    Ok(())
}

/// Take one frame off the front of `src`.
///
/// Returns `Ok(None)` (leaving `src` untouched) while the frame is
/// still incomplete. The length is validated as soon as the prefix is
/// in, so an oversized frame fails before its body arrives.
pub fn decode(src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    if src.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if frame_len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if frame_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(frame_len));
    }

    if src.len() < LENGTH_PREFIX_LEN + frame_len {
        src.reserve(LENGTH_PREFIX_LEN + frame_len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_LEN);
    let body = src.split_to(frame_len);
    decode_envelope(&body).map(Some)
}
