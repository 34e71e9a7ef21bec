//! Wire sample formats and their internal accumulator widths.
//!
//! The wire format fixes the byte layout a client pipe carries; the
//! accumulator format is strictly wider so that summing several clients
//! cannot overflow before `read` clips on the way out (spec: mixing must
//! not saturate on `add`, only on `read`).

use enum_primitive::FromPrimitive;

enum_primitive::enum_from_primitive! {
/// One of the four formats this engine understands. Anything else
/// (notably the three-byte-packed S24 variant) is rejected by
/// `Coordinator::enabled`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SampleFormat {
    U8 = 0,
    S16LE = 1,
    S24LE = 2,
    S32LE = 3,
}
}

impl SampleFormat {
    /// Bytes per sample on the wire.
    pub fn wire_bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16LE => 2,
            SampleFormat::S24LE => 4,
            SampleFormat::S32LE => 4,
        }
    }

    /// Bytes per frame for the given channel count.
    pub fn frame_size(self, channels: u8) -> usize {
        self.wire_bytes() * channels as usize
    }

    /// Decode a raw wire format code, as would arrive from transport
    /// metadata external to this crate.
    pub fn from_wire_code(code: u8) -> Option<Self> {
        SampleFormat::from_u8(code)
    }

    /// The three-byte-packed S24 layout is explicitly unsupported by the
    /// multi-client path (see `Coordinator::enabled`); it is not one of
    /// the four variants above, so there is nothing to special-case here
    /// beyond documenting why `from_wire_code` never returns it.
    pub fn is_multi_capable(self) -> bool {
        true
    }
}

pub(crate) const U8_CENTER: i16 = 0x80;
pub(crate) const S24_MIN: i32 = -0x0080_0000;
pub(crate) const S24_MAX: i32 = 0x007F_FFFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes_match_spec_table() {
        assert_eq!(SampleFormat::U8.wire_bytes(), 1);
        assert_eq!(SampleFormat::S16LE.wire_bytes(), 2);
        assert_eq!(SampleFormat::S24LE.wire_bytes(), 4);
        assert_eq!(SampleFormat::S32LE.wire_bytes(), 4);
    }

    #[test]
    fn frame_size_scales_with_channels() {
        assert_eq!(SampleFormat::S16LE.frame_size(2), 4);
        assert_eq!(SampleFormat::S32LE.frame_size(6), 24);
    }

    #[test]
    fn decodes_known_codes_only() {
        assert_eq!(SampleFormat::from_wire_code(1), Some(SampleFormat::S16LE));
        assert_eq!(SampleFormat::from_wire_code(99), None);
    }
}
