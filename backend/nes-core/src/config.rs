//! Core-level configuration: the audio tuning knobs the expansion chips'
//! amplitude formulas read directly, plus timing mode and output format.
//! Reading these from a file/CLI/GUI is outside this crate's scope; this
//! module only defines the data shape.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TimingMode {
    Ntsc,
    Pal,
    Dendy,
}

impl TimingMode {
    #[must_use]
    pub fn cpu_clock_divider(self) -> u32 {
        match self {
            Self::Ntsc => 12,
            Self::Pal => 16,
            Self::Dendy => 15,
        }
    }

    #[must_use]
    pub fn ppu_clock_divider(self) -> u32 {
        match self {
            Self::Ntsc | Self::Dendy => 4,
            Self::Pal => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum AudioChannels {
    Mono,
    Stereo,
}

#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct NesCoreConfig {
    pub forced_timing_mode: Option<TimingMode>,

    pub sample_rate: u32,
    pub channels: AudioChannels,

    pub dynamic_rate_control: bool,
    /// Maximum total rate adjustment, as a fraction (0.005 == 0.5%).
    pub rate_adjust_max: f64,
    pub low_watermark_frames: u32,
    pub buffer_range_frames: u32,

    pub apu_pulse0_volume: u32,
    pub apu_pulse1_volume: u32,
    pub apu_triangle_volume: u32,
    pub apu_noise_volume: u32,
    pub apu_dmc_volume: u32,

    pub vrc6_pulse0_volume: u8,
    pub vrc6_pulse1_volume: u8,
    pub vrc6_sawtooth_volume: u8,

    pub vrc7_channel_volume: [u8; 6],
    pub mmc5_pulse0_volume: u8,
    pub mmc5_pulse1_volume: u8,
    pub mmc5_pcm_volume: u8,
    pub namco163_channel_volume: [u8; 8],
    pub fds_volume: u8,
    pub sunsoft5b_channel_volume: [u8; 3],
}

impl Default for NesCoreConfig {
    fn default() -> Self {
        Self {
            forced_timing_mode: None,
            sample_rate: 48000,
            channels: AudioChannels::Mono,
            dynamic_rate_control: true,
            rate_adjust_max: 0.005,
            low_watermark_frames: 3,
            buffer_range_frames: 6,
            apu_pulse0_volume: 100,
            apu_pulse1_volume: 100,
            apu_triangle_volume: 100,
            apu_noise_volume: 100,
            apu_dmc_volume: 100,
            vrc6_pulse0_volume: 100,
            vrc6_pulse1_volume: 100,
            vrc6_sawtooth_volume: 100,
            vrc7_channel_volume: [100; 6],
            mmc5_pulse0_volume: 100,
            mmc5_pulse1_volume: 100,
            mmc5_pcm_volume: 100,
            namco163_channel_volume: [100; 8],
            fds_volume: 100,
            sunsoft5b_channel_volume: [100; 3],
        }
    }
}
