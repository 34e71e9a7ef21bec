//! The Ring-Mix Buffer: a fixed-capacity circular sample accumulator.
//!
//! Ported line-for-line (arithmetic, not syntax) from
//! `bluealsa-mix-buffer.c`. One consumer (`read`, driven by the
//! transport thread through the coordinator) and many producers
//! (`add`, driven by the worker thread on behalf of each client) share
//! the accumulator; invariants I1-I4 (documented per-method below) hold
//! throughout.

use crate::format::{SampleFormat, S24_MAX, S24_MIN, U8_CENTER};

/// Per-format accumulator storage. One variant is picked at `init` and
/// used for the buffer's lifetime -- this is the "role-typed buffer at
/// construction" the design notes call for, avoiding a runtime tag
/// check in `add`/`read`'s hot loop.
enum Accumulator {
    U8(Vec<i16>),
    S16(Vec<i32>),
    S24(Vec<i32>),
    S32(Vec<i64>),
}

impl Accumulator {
    fn new(format: SampleFormat, size: usize) -> Self {
        match format {
            SampleFormat::U8 => Accumulator::U8(vec![0; size]),
            SampleFormat::S16LE => Accumulator::S16(vec![0; size]),
            SampleFormat::S24LE => Accumulator::S24(vec![0; size]),
            SampleFormat::S32LE => Accumulator::S32(vec![0; size]),
        }
    }

    fn clear(&mut self) {
        match self {
            Accumulator::U8(v) => v.iter_mut().for_each(|s| *s = 0),
            Accumulator::S16(v) => v.iter_mut().for_each(|s| *s = 0),
            Accumulator::S24(v) => v.iter_mut().for_each(|s| *s = 0),
            Accumulator::S32(v) => v.iter_mut().for_each(|s| *s = 0),
        }
    }
}

/// A fixed-capacity circular sample accumulator shared by every client
/// of a playback coordinator.
pub struct RingMixBuffer {
    format: SampleFormat,
    channels: u8,
    frame_size: usize,
    data: Accumulator,
    /// Capacity in samples: `(1 + buffer_frames) * channels`.
    size: usize,
    /// Samples transferred per `read` call: `period_frames * channels`.
    period: usize,
    /// Next sample to be read, monotonic modulo `size`.
    mix_offset: usize,
    /// One-past-last sample written, monotonic modulo `size`.
    end: usize,
    mix_threshold_periods: usize,
}

impl RingMixBuffer {
    /// Allocate a zeroed accumulator sized for `buffer_frames` worth of
    /// history. `mix_threshold_periods` is the (MIX_THRESHOLD+1) window
    /// used for client admission, i.e. the value of §4.1's back-pressure
    /// bound and §4.3's `at_threshold` fill gate.
    pub fn init(
        format: SampleFormat,
        channels: u8,
        buffer_frames: usize,
        period_frames: usize,
        mix_threshold_periods: usize,
    ) -> crate::error::Result<Self> {
        if channels < 1 || channels > 8 {
            return Err(crate::error::Error::UnsupportedFormat);
        }
        let size = (1 + buffer_frames) * channels as usize;
        let period = period_frames * channels as usize;
        Ok(RingMixBuffer {
            format,
            channels,
            frame_size: format.frame_size(channels),
            data: Accumulator::new(format, size),
            size,
            period,
            mix_offset: 0,
            end: 0,
            mix_threshold_periods,
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// (I1) `avail(start, end) = (end - start) mod size`.
    pub fn calc_avail(&self, start: usize, end: usize) -> usize {
        if end >= start {
            end - start
        } else {
            self.size + end - start
        }
    }

    pub fn empty(&self) -> bool {
        self.mix_offset == self.end
    }

    /// `avail(mix_offset, offset)`, interpreting `offset` the same way
    /// `add` does (a non-negative absolute position).
    pub fn delay(&self, offset: usize) -> usize {
        self.calc_avail(self.mix_offset, offset)
    }

    /// Resolves a client's `out_offset` the same way `add` does: a
    /// negative value is "this many samples ahead of `mix_offset`",
    /// anything else is already an absolute position. Shared so callers
    /// that need a client's absolute position without admitting data
    /// (e.g. `Pause`'s phase-preservation recompute) use the identical
    /// arithmetic `add` uses internally, rather than a second copy of it.
    pub fn resolve_offset(&self, offset: i64) -> usize {
        if offset < 0 {
            (((self.mix_offset as i64) - offset) as usize) % self.size
        } else {
            offset as usize
        }
    }

    pub fn at_threshold(&self) -> bool {
        let avail = self.calc_avail(self.mix_offset, self.end);
        avail * self.channels as usize >= self.mix_threshold_periods * self.period
    }

    /// Reset offsets and zero the accumulator. Idempotent (P5).
    pub fn clear(&mut self) {
        self.mix_offset = 0;
        self.end = 0;
        self.data.clear();
    }

    /// Admit up to `bytes` worth of whole frames from a client into the
    /// mix at `offset` (negative meaning "ahead of `mix_offset`").
    /// Returns the number of bytes actually consumed, always a whole
    /// multiple of `frame_size`. Updates `*offset` to the post-write
    /// position, expressed the same way `read`'s `delay` expects it
    /// (an absolute position, never again negative once resolved here).
    pub fn add(&mut self, offset: &mut i64, data: &[u8], bytes: usize) -> usize {
        let mix_offset = self.mix_offset;
        let avail = self.calc_avail(mix_offset, self.end);

        let mut start: usize = self.resolve_offset(*offset);

        let frames = bytes / self.frame_size;
        let mut samples = frames * self.channels as usize;

        // Do not let this client advance further than
        // (MIX_THRESHOLD+1) periods ahead of mix_offset. Preserves the
        // "at most one wrap" property noted as an open question: a
        // single `add` call is bounded by `period <= size` (I4), so the
        // `start < mix_offset` correction below applies at most once.
        if start < mix_offset {
            start += self.size;
        }
        let limit = mix_offset + (self.mix_threshold_periods + 1) * self.period;
        if start >= limit {
            *offset = start as i64;
            return 0;
        }
        if start + samples > limit {
            samples = limit - start;
        }

        let mut n = 0;
        while n < samples {
            if start + n >= self.size {
                start -= self.size;
            }
            self.add_sample(start + n, data, n);
            n += 1;
        }

        let new_offset = start + n;
        *offset = new_offset as i64;

        // (I3/end-advance rule) only move `end` forward if this
        // addition actually extended the readable range.
        if self.calc_avail(mix_offset, new_offset) > avail {
            self.end = new_offset;
        }

        samples * self.frame_size / self.channels as usize
    }

    fn add_sample(&mut self, cell: usize, data: &[u8], sample_index: usize) {
        match (&mut self.data, self.format) {
            (Accumulator::U8(acc), SampleFormat::U8) => {
                let byte = data[sample_index];
                acc[cell] += byte as i16 - U8_CENTER;
            }
            (Accumulator::S16(acc), SampleFormat::S16LE) => {
                let off = sample_index * 2;
                let v = i16::from_le_bytes([data[off], data[off + 1]]);
                acc[cell] += v as i32;
            }
            (Accumulator::S24(acc), SampleFormat::S24LE) => {
                let off = sample_index * 4;
                let raw = u32::from_le_bytes([
                    data[off],
                    data[off + 1],
                    data[off + 2],
                    data[off + 3],
                ]);
                // S24-in-32: sign-extend from bit 23.
                let v = if raw & 0x0080_0000 != 0 {
                    (raw | 0xFF00_0000) as i32
                } else {
                    (raw & 0x00FF_FFFF) as i32
                };
                acc[cell] += v;
            }
            (Accumulator::S32(acc), SampleFormat::S32LE) => {
                let off = sample_index * 4;
                let raw = u32::from_le_bytes([
                    data[off],
                    data[off + 1],
                    data[off + 2],
                    data[off + 3],
                ]);
                acc[cell] += raw as i32 as i64;
            }
            _ => unreachable!("accumulator variant always matches buffer format"),
        }
    }

    /// Read, scale, clip, and zero up to `samples` (a whole multiple of
    /// `channels`) from the mix, writing little-endian wire frames into
    /// `dst`. Returns the number of samples actually produced.
    pub fn read(&mut self, dst: &mut [u8], samples: usize, scale: &[f64]) -> usize {
        assert_eq!(samples % self.channels as usize, 0);
        assert!(scale.len() >= self.channels as usize);

        let mut start = self.mix_offset;
        let end = self.end;
        let mut samples = samples - (samples % self.channels as usize);

        if samples > self.period {
            samples = self.period;
        }
        let avail = self.calc_avail(start, end);
        if samples > avail {
            samples = avail;
        }

        let mut out = 0usize;
        let mut n = 0usize;
        while n < samples {
            if start + n >= self.size {
                start -= self.size;
            }
            for channel in 0..self.channels as usize {
                out += self.read_sample(start + n + channel, channel, scale, &mut dst[out..]);
            }
            n += self.channels as usize;
        }

        self.mix_offset = start + n;
        samples
    }

    fn read_sample(
        &mut self,
        cell: usize,
        channel: usize,
        scale: &[f64],
        dst: &mut [u8],
    ) -> usize {
        let s = scale[channel];
        match (&mut self.data, self.format) {
            (Accumulator::U8(acc), SampleFormat::U8) => {
                let mut v = acc[cell];
                if s == 0.0 {
                    v = 0;
                } else {
                    v = (v as f64 * s).round() as i16;
                    v = v.clamp(i8::MIN as i16, i8::MAX as i16);
                }
                acc[cell] = 0;
                dst[0] = ((v + U8_CENTER) as u8).to_le();
                1
            }
            (Accumulator::S16(acc), SampleFormat::S16LE) => {
                let mut v = acc[cell];
                if s == 0.0 {
                    v = 0;
                } else {
                    // Unity-gain identity path: skip the multiply when
                    // the scale is effectively 1.0, for bit-exactness.
                    if s < 0.99 {
                        v = (v as f64 * s).round() as i32;
                    }
                    v = v.clamp(i16::MIN as i32, i16::MAX as i32);
                }
                acc[cell] = 0;
                let bytes = (v as i16).to_le_bytes();
                dst[..2].copy_from_slice(&bytes);
                2
            }
            (Accumulator::S24(acc), SampleFormat::S24LE) => {
                let mut v = acc[cell];
                if s == 0.0 {
                    v = 0;
                } else {
                    v = (v as f64 * s).round() as i32;
                    v = v.clamp(S24_MIN, S24_MAX);
                }
                acc[cell] = 0;
                let packed = (v as u32) & 0x00FF_FFFF;
                let bytes = packed.to_le_bytes();
                dst[..4].copy_from_slice(&bytes);
                4
            }
            (Accumulator::S32(acc), SampleFormat::S32LE) => {
                let mut v = acc[cell];
                if s == 0.0 {
                    v = 0;
                } else {
                    v = (v as f64 * s).round() as i64;
                    v = v.clamp(i32::MIN as i64, i32::MAX as i64);
                }
                acc[cell] = 0;
                let bytes = (v as i32).to_le_bytes();
                dst[..4].copy_from_slice(&bytes);
                4
            }
            _ => unreachable!("accumulator variant always matches buffer format"),
        }
    }
}
