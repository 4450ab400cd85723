//! Namco 163 expansion audio: up to 8 wavetable channels time-multiplexed
//! through 128 bytes of internal RAM, grounded on
//! `boards/audio/namco163_audio.c`. Rather than giving each channel its own
//! next-clock slot, the original walks backwards through the active
//! channel range once per elapsed tick and accumulates a single shared
//! `timestamp`; this port keeps that shape instead of recasting it as a
//! per-channel scheduling loop like the other PSG-style chips.
//!
//! The board-level address decoding that widens `$4800`/`$E000`/`$F800`
//! into their full mirrored ranges normally lives in the Namco 163 mapper
//! board file, which is out of scope here (general mapper catalogue). This
//! port installs the mirrored ranges itself so the chip is usable
//! standalone; see DESIGN.md.

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::NesCoreConfig;
use crate::cpu::{Component, HandlerTable};

const GAIN: i64 = 260;
const MIXER_ADJUST: [i64; 9] = [256, 256, 128, 256 / 3, 64, 256 / 5, 256 / 6, 256 / 6, 256 / 6];

#[derive(Debug, Clone, Encode, Decode)]
pub struct Namco163Audio {
    ram: [u8; 0x80],
    current_address: u8,
    auto_increment: bool,
    enabled: bool,
    next_channel: u8,
    last_amp: [i32; 8],
    timestamp: u32,
    apu_clock_divider: u32,
}

impl Namco163Audio {
    #[must_use]
    pub fn new(apu_clock_divider: u32) -> Self {
        let mut audio = Self {
            ram: [0; 0x80],
            current_address: 0,
            auto_increment: false,
            enabled: false,
            next_channel: 7,
            last_amp: [0; 8],
            timestamp: 0,
            apu_clock_divider,
        };
        audio.reset(true);
        audio
    }

    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        handlers.set_write(0x4800, 0x800, 0, Component::Namco163);
        handlers.set_read(0x4800, 0x800, 0, Component::Namco163);
        handlers.set_write(0xe000, 0x800, 0, Component::Namco163);
        handlers.set_write(0xf800, 0x800, 0, Component::Namco163);
    }

    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.ram = [0; 0x80];
            self.current_address = 0;
            self.auto_increment = false;
            self.enabled = true;
            self.next_channel = 7;
            self.last_amp = [0; 8];
        }
        self.timestamp = 0;
    }

    pub fn end_frame(&mut self, cycles: u32) {
        self.timestamp = self.timestamp.wrapping_sub(cycles);
    }

    fn channel_length(&self, c: usize) -> i32 {
        256 - i32::from(self.ram[(c << 3) | 0x44] & 0xfc)
    }

    fn channel_volume(&self, c: usize) -> i64 {
        i64::from(self.ram[(c << 3) | 0x47] & 0x0f)
    }

    fn channel_frequency(&self, c: usize) -> i32 {
        (i32::from(self.ram[(c << 3) | 0x40])
            | (i32::from(self.ram[(c << 3) | 0x42]) << 8)
            | (i32::from(self.ram[(c << 3) | 0x44]) << 16))
            & 0x3ffff
    }

    fn channel_phase(&self, c: usize) -> i32 {
        (i32::from(self.ram[(c << 3) | 0x41])
            | (i32::from(self.ram[(c << 3) | 0x43]) << 8)
            | (i32::from(self.ram[(c << 3) | 0x45]) << 16))
            & 0xffffff
    }

    fn set_channel_phase(&mut self, c: usize, phase: i32) {
        self.ram[(c << 3) | 0x41] = (phase & 0xff) as u8;
        self.ram[(c << 3) | 0x43] = ((phase >> 8) & 0xff) as u8;
        self.ram[(c << 3) | 0x45] = ((phase >> 16) & 0xff) as u8;
    }

    fn active_channels(&self) -> u8 {
        (self.ram[0x7f] >> 4) & 0x07
    }

    fn channel_amp(&self, c: usize, phase: i32, config: &NesCoreConfig) -> i32 {
        let enabled = self.active_channels();
        let volume = self.channel_volume(c);

        let mut addr = i32::from(self.ram[0x46 | (c << 3)]);
        addr += phase >> 16;
        addr &= 0xff;

        let mut amp = i64::from(self.ram[(addr >> 1) as usize]);
        if addr & 1 != 0 {
            amp >>= 4;
        }
        amp &= 0x0f;
        amp = 8 - amp;
        amp *= volume;
        amp *= MIXER_ADJUST[usize::from(enabled) + 1];
        amp *= i64::from(config.namco163_channel_volume[c]);
        amp *= GAIN;
        amp /= 100 * 256;

        amp as i32
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if !self.enabled {
            self.timestamp = cycles;
            return;
        }

        let divisor = self.apu_clock_divider * 15;
        let mut clocks_elapsed = cycles.wrapping_sub(self.timestamp) / divisor;

        let min_channel = 7 - self.active_channels();
        let mut channel = self.next_channel;
        if channel < min_channel {
            channel = 7;
        }

        let multiplier = 15 * self.apu_clock_divider;

        while clocks_elapsed > 0 {
            let c = usize::from(channel);
            let old_phase = self.channel_phase(c);
            let length = self.channel_length(c);
            let frequency = self.channel_frequency(c);
            let mut phase = (old_phase + frequency) & 0x00ff_ffff;
            let limit = length << 16;
            while phase >= limit {
                phase -= limit;
            }

            self.set_channel_phase(c, phase);
            self.timestamp = self.timestamp.wrapping_add(multiplier);
            let amp = self.channel_amp(c, phase, config);
            let delta = amp - self.last_amp[c];
            if delta != 0 {
                acc.add_delta(self.timestamp, delta);
                self.last_amp[c] = amp;
            }

            clocks_elapsed -= 1;
            if channel == 0 {
                channel = 7;
            } else {
                channel -= 1;
            }
            if channel < min_channel {
                channel = 7;
            }
        }

        self.next_channel = channel;
    }

    pub fn read(&mut self, addr: u16, cycle: u32, bus_value: u8, acc: &mut DeltaAccumulator, config: &NesCoreConfig) -> u8 {
        self.run(cycle, acc, config);

        if addr >= 0x4800 {
            let value = self.ram[self.current_address as usize];
            if self.auto_increment {
                self.current_address = (self.current_address + 1) & 0x7f;
            }
            value
        } else {
            bus_value
        }
    }

    pub fn write(&mut self, addr: u16, value: u8, cycle: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run(cycle, acc, config);

        if addr >= 0xf800 {
            self.current_address = value & 0x7f;
            self.auto_increment = value & 0x80 != 0;
        } else if (0xe000..0xe800).contains(&addr) {
            self.enabled = value & 0x40 == 0;
        } else if addr >= 0x4800 {
            self.ram[self.current_address as usize] = value;
            if self.auto_increment {
                self.current_address = (self.current_address + 1) & 0x7f;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (Namco163Audio, DeltaAccumulator, NesCoreConfig) {
        (Namco163Audio::new(12), DeltaAccumulator::new(1_789_773, 48_000), NesCoreConfig::default())
    }

    #[test]
    fn ram_port_auto_increment_wraps_at_the_128_byte_boundary() {
        let (mut chip, mut acc, config) = harness();

        chip.write(0xf800, 0xff, 0, &mut acc, &config); // address 0x7f, auto-increment on
        chip.write(0x4800, 0x11, 1, &mut acc, &config);
        assert_eq!(chip.current_address, 0x00, "increment from 0x7f must wrap to 0");
        assert_eq!(chip.ram[0x7f], 0x11);

        chip.write(0x4800, 0x22, 2, &mut acc, &config);
        assert_eq!(chip.ram[0x00], 0x22);
        assert_eq!(chip.current_address, 0x01);
    }

    #[test]
    fn enable_bit_is_active_low() {
        let (mut chip, mut acc, config) = harness();

        chip.write(0xe000, 0x40, 0, &mut acc, &config);
        assert!(!chip.enabled);

        chip.write(0xe000, 0x00, 1, &mut acc, &config);
        assert!(chip.enabled);
    }

    #[test]
    fn single_active_channel_walk_never_leaves_channel_seven() {
        let (mut chip, mut acc, config) = harness();

        // Bits 6-4 of RAM 0x7f select how many of the 8 channels are
        // active; 0 here means only channel 7 runs.
        chip.ram[0x7f] = 0x00;
        chip.ram[(7 << 3) | 0x42] = 0x01; // nonzero frequency so phase actually advances
        assert_eq!(chip.active_channels(), 0);

        let divisor = u32::from(chip.apu_clock_divider) * 15;
        chip.run(divisor * 4, &mut acc, &config);

        assert_eq!(chip.next_channel, 7);
    }
}
