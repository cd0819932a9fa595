//! Newline-delimited JSON framing, for netcat and scripting tools.
//!
//! Each envelope is one line of JSON terminated by `\n`. A trailing
//! `\r` is tolerated; blank lines are skipped.

use bytes::{BufMut, BytesMut};
use hub_core::Envelope;

use crate::json_codec::{decode_envelope, encode_envelope, ProtocolError};
use crate::wire_types::MAX_FRAME_LEN;

/// Append one `\n`-terminated envelope to `dst`.
pub fn encode(envelope: &Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = encode_envelope(envelope)?;

    dst.reserve(body.len() + 1);
    dst.extend_from_slice(&body);
    dst.put_u8(b'\n');
    Ok(())
}

/// Take one line off the front of `src`.
pub fn decode(src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    decode_resuming(src, &mut 0)
}

/// Like [`decode`], but skips the first `scanned` bytes when looking for
/// the newline. `scanned` is updated so a partial line is only searched
/// once, however many reads it takes to arrive.
pub fn decode_resuming(src: &mut BytesMut, scanned: &mut usize) -> Result<Option<Envelope>, ProtocolError> {
    loop {
        let start = (*scanned).min(src.len());
        let newline_pos = match src[start..].iter().position(|&b| b == b'\n') {
            Some(offset) => start + offset,
            None if src.len() > MAX_FRAME_LEN => {
                return Err(ProtocolError::FrameTooLarge(src.len()));
            }
            None => {
                *scanned = src.len();
                return Ok(None);
            }
        };

        *scanned = 0;
        let line = src.split_to(newline_pos + 1);
        let body = &line[..newline_pos];
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return decode_envelope(body).map(Some);
    }
}
