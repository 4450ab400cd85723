//! Dynamic rate control (§4.6), grounded on `sdl/sdl_audio.c`'s
//! `audio_fill_buffer`. Tracks consumer-side ring buffer occupancy and
//! nudges the producer's effective output sample rate by a tiny amount
//! each frame so that a drifting host audio clock never needs a sample
//! to be dropped or duplicated.

use bincode::{Decode, Encode};

/// Per-adjustment-step clamp: never move the rate by more than 0.1% in a
/// single frame, regardless of how far outside the watermarks we are.
const MAX_STEP_PERCENT: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct RateControlConfig {
    pub base_sample_rate: u32,
    pub low_watermark_frames: u32,
    pub buffer_range_frames: u32,
    /// Total clamp on cumulative adjustment, e.g. 0.005 == ±0.5%.
    pub max_adjust: f64,
    pub frames_per_second: f64,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct RateController {
    config: RateControlConfig,
    /// Current cumulative adjustment, as a fraction of `base_sample_rate`.
    adjustment: f64,
    previous_difference: i64,
    /// Consecutive frames before the next adjustment is allowed to change
    /// direction; mirrors cxnes's `dynamic_rate_adjustment_delay` cooldown.
    skip_delay: u32,
}

impl RateController {
    #[must_use]
    pub fn new(config: RateControlConfig) -> Self {
        Self { config, adjustment: 0.0, previous_difference: 0, skip_delay: 0 }
    }

    #[must_use]
    pub fn effective_sample_rate(&self) -> u32 {
        (f64::from(self.config.base_sample_rate) * (1.0 + self.adjustment)).round() as u32
    }

    /// Called once per emulator frame with the consumer-side ring buffer's
    /// current sample occupancy.
    pub fn update(&mut self, samples_available: usize) {
        let samples_per_frame =
            f64::from(self.config.base_sample_rate) / self.config.frames_per_second;

        let low_watermark = samples_per_frame * f64::from(self.config.low_watermark_frames);
        let high_watermark = low_watermark
            + samples_per_frame * f64::from(self.config.buffer_range_frames);

        let samples = samples_available as f64;

        let difference = if samples < low_watermark {
            samples - low_watermark
        } else if samples > high_watermark {
            samples - high_watermark
        } else {
            self.skip_delay = 0;
            self.previous_difference = 0;
            return;
        };

        let difference_i = difference.round() as i64;
        let same_direction = (difference_i > 0) == (self.previous_difference > 0);
        let growing =
            difference_i.unsigned_abs() >= self.previous_difference.unsigned_abs();

        if self.previous_difference != 0 && !(same_direction && growing) {
            if self.skip_delay > 0 {
                self.skip_delay -= 1;
                self.previous_difference = difference_i;
                return;
            }
        }

        let raw_step = -1.2 * (difference / samples_per_frame) / self.config.frames_per_second;
        let clamped_step = raw_step.clamp(-MAX_STEP_PERCENT, MAX_STEP_PERCENT);

        self.adjustment =
            (self.adjustment + clamped_step).clamp(-self.config.max_adjust, self.config.max_adjust);

        self.previous_difference = difference_i;
        self.skip_delay = 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateControlConfig {
        RateControlConfig {
            base_sample_rate: 48_000,
            low_watermark_frames: 3,
            buffer_range_frames: 6,
            max_adjust: 0.005,
            frames_per_second: 60.0,
        }
    }

    #[test]
    fn within_watermarks_is_a_no_op() {
        let mut rc = RateController::new(config());
        let samples_per_frame = 48_000.0 / 60.0;
        rc.update((samples_per_frame * 4.5) as usize);
        assert_eq!(rc.effective_sample_rate(), 48_000);
    }

    #[test]
    fn buffer_starvation_raises_rate() {
        let mut rc = RateController::new(config());
        rc.update(0);
        assert!(rc.effective_sample_rate() > 48_000);
    }

    #[test]
    fn adjustment_never_exceeds_configured_max() {
        let mut rc = RateController::new(config());
        for _ in 0..10_000 {
            rc.update(0);
        }
        let max_rate = 48_000.0 * 1.005;
        assert!(f64::from(rc.effective_sample_rate()) <= max_rate + 1.0);
    }
}
