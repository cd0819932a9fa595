//! hub-protocol
//!
//! Wire-level encoding/decoding for hub envelopes.
//!
//! This crate is responsible for turning logical envelopes
//! (`hub_core::Envelope`) into framed bytes and back again.
//!
//! - [`json_codec`]   : envelope body <-> JSON bytes
//! - [`frame_codec`]  : u32 length-prefixed frames (binary clients)
//! - [`line_codec`]   : newline-delimited frames (netcat / tooling)
//!
//! Decoders work over a growable [`bytes::BytesMut`] read buffer and
//! return `Ok(None)` until a complete frame is available.

pub mod wire_types;
pub mod json_codec;
pub mod frame_codec;
pub mod line_codec;

use bytes::BytesMut;
use hub_core::Envelope;

pub use json_codec::{decode_envelope, encode_envelope, ProtocolError};
pub use wire_types::{FrameFormat, MAX_FRAME_LEN};

/// Append one framed envelope to `dst` in the given format.
pub fn encode_frame(
    format: FrameFormat,
    envelope: &Envelope,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    match format {
        FrameFormat::LengthPrefixed => frame_codec::encode(envelope, dst),
        FrameFormat::Lines => line_codec::encode(envelope, dst),
    }
}

/// Take one complete envelope off the front of `src`, if there is one.
pub fn decode_frame(
    format: FrameFormat,
    src: &mut BytesMut,
) -> Result<Option<Envelope>, ProtocolError> {
    match format {
        FrameFormat::LengthPrefixed => frame_codec::decode(src),
        FrameFormat::Lines => line_codec::decode(src),
    }
}

/// Incremental decoder for one inbound stream.
///
/// Same as [`decode_frame`], but remembers how much of a partial line
/// was already searched, so a slow peer cannot make each read rescan
/// the whole buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    format: FrameFormat,
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(format: FrameFormat) -> Self {
        Self { format, scanned: 0 }
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        match self.format {
            FrameFormat::LengthPrefixed => frame_codec::decode(src),
            FrameFormat::Lines => line_codec::decode_resuming(src, &mut self.scanned),
        }
    }
}
