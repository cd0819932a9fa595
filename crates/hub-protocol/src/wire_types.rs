//! Low-level wire constants and framing formats.
//!
//! The actual encode/decode logic lives in `frame_codec` and
//! `line_codec`.

/// Hard limit on one frame body (64 KiB).
///
/// Peers sending anything larger are treated as malformed, which is
/// terminal for their connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Size of the big-endian length prefix in `LengthPrefixed` framing.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// How envelopes are delimited on a byte stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameFormat {
    /// `[len: u32 BE][len bytes of JSON]`.
    LengthPrefixed,

    /// One JSON document per `\n`-terminated line.
    Lines,
}

impl FrameFormat {
    /// Guess the framing from the first byte a peer sends.
    ///
    /// A JSON document starts with `{`; a length prefix for any frame
    /// under 64 KiB starts with `0x00`.
    pub fn detect(first_byte: u8) -> Self {
        if first_byte == b'{' {
            FrameFormat::Lines
        } else {
            FrameFormat::LengthPrefixed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_from_first_byte() {
        assert_eq!(FrameFormat::detect(b'{'), FrameFormat::Lines);
        assert_eq!(FrameFormat::detect(0x00), FrameFormat::LengthPrefixed);
    }
}
