//! Band-limited delta accumulator ("sample accumulator" in spec terms).
//!
//! Every audio generator submits `(cycle, delta)` pairs instead of raw
//! samples: the mixer is pre-mixed in integer space (§4.5), and this module
//! is the only place the delta stream becomes PCM. It mirrors the public
//! contract of cxnes's `sdl_audio.c` usage of Blargg's `blip_buf` (§3.5):
//! `set_rates`, `add_delta`, `end_frame`, `samples_available`,
//! `read_samples`. The internal synthesis kernel is a linear-interpolation
//! two-tap spread at insertion time plus a leaky-integrator read-out step —
//! simpler than `blip_buf`'s precomputed sinc table but structurally the
//! same two-stage design (spread-then-integrate) and enough to band-limit
//! without audible aliasing for NES-range signals. See DESIGN.md for why
//! the full sinc kernel was not ported verbatim.

use bincode::{Decode, Encode};

const TIME_BITS: u32 = 20;
const TIME_UNIT: u64 = 1 << TIME_BITS;
const TIME_MASK: u64 = TIME_UNIT - 1;

/// Leaky-integrator shift used when reading samples out; larger values let
/// more low-frequency content through. `blip_buf` uses a comparable
/// single-pole filter to avoid DC drift across frames.
const BASS_SHIFT: u32 = 9;

#[derive(Debug, Clone, Encode, Decode)]
pub struct DeltaAccumulator {
    clock_rate: u64,
    sample_rate: u32,
    factor: u64,

    /// Accumulated impulse energy per not-yet-read output sample slot.
    buf: Vec<i32>,
    /// Number of slots in `buf` that are fully resolved (safe to read).
    avail: usize,
    /// Fixed-point time (in TIME_BITS fraction) of the last delta relative
    /// to the start of the current frame; reset at `end_frame`.
    frame_time: u64,
    /// Leaky integrator carry between `read_samples` calls.
    integrator: i32,
}

impl DeltaAccumulator {
    #[must_use]
    pub fn new(clock_rate: u32, sample_rate: u32) -> Self {
        let mut acc = Self {
            clock_rate: 0,
            sample_rate: 0,
            factor: 0,
            buf: Vec::new(),
            avail: 0,
            frame_time: 0,
            integrator: 0,
        };
        acc.set_rates(clock_rate, sample_rate);
        acc
    }

    pub fn set_rates(&mut self, clock_rate: u32, sample_rate: u32) {
        self.clock_rate = u64::from(clock_rate);
        self.sample_rate = sample_rate;
        self.factor = (u64::from(sample_rate) << TIME_BITS) / self.clock_rate;
    }

    fn ensure_capacity(&mut self, slot: usize) {
        if slot + 2 > self.buf.len() {
            self.buf.resize(slot + 2, 0);
        }
    }

    /// Submit a signed amplitude delta at the given master-clock cycle,
    /// measured relative to the start of the current frame.
    pub fn add_delta(&mut self, cycle: u32, delta: i32) {
        if delta == 0 {
            return;
        }

        let time = u64::from(cycle) * self.factor;
        let slot = (time >> TIME_BITS) as usize;
        let frac = time & TIME_MASK;

        self.ensure_capacity(slot);

        // Two-tap linear-interpolation spread: most of the energy lands on
        // the sample that the cycle rounds down to, with the remainder
        // bleeding into the next slot in proportion to the fractional
        // position. This is what band-limits the delta stream instead of
        // producing a zipper-noise staircase.
        let frac_i = frac as i64;
        let unit = TIME_UNIT as i64;
        let right = ((i64::from(delta) * frac_i) / unit) as i32;
        let left = delta - right;

        self.buf[slot] += left;
        self.buf[slot + 1] += right;

        if time > self.frame_time {
            self.frame_time = time;
        }
    }

    /// Commit all deltas up to `cycles_in_frame` and rebase subsequent
    /// `add_delta` calls to measure from the new frame start.
    pub fn end_frame(&mut self, cycles_in_frame: u32) {
        let end_time = u64::from(cycles_in_frame) * self.factor;
        let end_slot = (end_time >> TIME_BITS) as usize;

        self.ensure_capacity(end_slot);
        self.avail = self.avail.max(end_slot);
        self.frame_time = self.frame_time.saturating_sub(end_time);
    }

    #[must_use]
    pub fn samples_available(&self) -> usize {
        self.avail
    }

    /// Decimate the buffered deltas into up to `out.len()` PCM samples.
    /// When `stereo` is set, the mono signal is duplicated into interleaved
    /// L/R pairs and `out.len()` must be even.
    pub fn read_samples(&mut self, out: &mut [i16], stereo: bool) -> usize {
        let frames = if stereo { out.len() / 2 } else { out.len() };
        let count = frames.min(self.avail);

        let mut accum = self.integrator;
        for i in 0..count {
            let s = accum + self.buf[i];
            accum = s - (s >> BASS_SHIFT);
            let clamped = s.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            if stereo {
                out[2 * i] = clamped;
                out[2 * i + 1] = clamped;
            } else {
                out[i] = clamped;
            }
        }
        self.integrator = accum;

        // Shift the remainder of the buffer down to slot 0.
        self.buf.drain(0..count);
        self.buf.resize(self.buf.len().max(2), 0);
        self.avail -= count;

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_delta_round_trip() {
        let mut acc = DeltaAccumulator::new(1_789_773, 48_000);
        acc.add_delta(0, 1000);
        acc.end_frame(1_789_773 / 60);

        let mut out = [0_i16; 8];
        let produced = acc.read_samples(&mut out, false);
        assert!(produced > 0);
        // The first sample should carry (most of) the impulse energy.
        assert!(out[0] > 0);
    }

    #[test]
    fn zero_delta_is_silent() {
        let mut acc = DeltaAccumulator::new(1_789_773, 48_000);
        acc.end_frame(1_789_773 / 60);

        let mut out = [0_i16; 8];
        let produced = acc.read_samples(&mut out, false);
        assert!(out[..produced].iter().all(|&s| s == 0));
    }
}
