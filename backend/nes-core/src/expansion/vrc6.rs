//! VRC6 expansion audio: two duty-cycle pulse channels plus one 7-bit
//! sawtooth accumulator, grounded on `boards/audio/vrc6_audio.c`. The VRC6b
//! board variant swaps the A0/A1 address lines, so the handler reorders the
//! low two address bits when `swap_lines` is set rather than installing a
//! separate handler table.

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::NesCoreConfig;
use crate::cpu::{Component, HandlerTable};

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct Pulse {
    counter: i32,
    period: u16,
    duty: u8,
    step: i32,
    volume: u8,
    mode: bool,
    enabled: bool,
    amplitude: i32,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct Sawtooth {
    counter: i32,
    period: u16,
    rate: u8,
    step: i32,
    accumulator: i32,
    enabled: bool,
    amplitude: i32,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Vrc6Audio {
    pulse: [Pulse; 2],
    sawtooth: Sawtooth,
    timestamp: u32,
    halt: bool,
    period_shift: u32,
    swap_lines: bool,
    last_amplitude: i32,
    apu_clock_divider: u32,
}

impl Vrc6Audio {
    #[must_use]
    pub fn new(apu_clock_divider: u32, swap_lines: bool) -> Self {
        Self {
            pulse: [Pulse::default(); 2],
            sawtooth: Sawtooth::default(),
            timestamp: 0,
            halt: false,
            period_shift: 0,
            swap_lines,
            last_amplitude: 0,
            apu_clock_divider,
        }
    }

    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        handlers.set_write(0x9000, 0x2003, 0, Component::Vrc6);
    }

    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.pulse = [Pulse::default(); 2];
            self.sawtooth = Sawtooth::default();
            self.halt = false;
            self.period_shift = 0;
        }
        self.timestamp = 0;
    }

    pub fn end_frame(&mut self, cycles: u32) {
        self.timestamp = self.timestamp.saturating_sub(cycles);
    }

    fn update_amplitude(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        const MASTER: i32 = (9752 * 256) / 15;

        let mut amplitude = self.pulse[0].amplitude + self.pulse[1].amplitude + self.sawtooth.amplitude;
        amplitude *= MASTER;
        amplitude >>= 8;
        let _ = config;

        if amplitude != self.last_amplitude {
            acc.add_delta(cycles, amplitude - self.last_amplitude);
            self.last_amplitude = amplitude;
        }
    }

    fn pulse_period_cycles(&self, pulse: &Pulse) -> i32 {
        (((pulse.period >> self.period_shift) as i32) + 1) * self.apu_clock_divider as i32
    }

    fn pulse_enable(&mut self, channel: usize, enabled: bool, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if self.pulse[channel].enabled == enabled {
            return;
        }
        let period_cycles = self.pulse_period_cycles(&self.pulse[channel]);
        if enabled {
            self.pulse[channel].counter = period_cycles;
        } else {
            self.pulse[channel].step = 15;
            self.pulse[channel].amplitude = 0;
            self.update_amplitude(cycles, acc, config);
        }
        self.pulse[channel].enabled = enabled;
    }

    fn sawtooth_enable(&mut self, enabled: bool, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if self.sawtooth.enabled == enabled {
            return;
        }
        if !enabled {
            self.sawtooth.step = 0;
            self.sawtooth.amplitude = 0;
            self.sawtooth.accumulator = 0;
            self.update_amplitude(cycles, acc, config);
        }
        self.sawtooth.enabled = enabled;
    }

    pub fn read(&self, _addr: u16, bus_value: u8) -> u8 {
        bus_value
    }

    pub fn write(&mut self, addr: u16, value: u8, cycle: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run(cycle, acc, config);

        let mut a = addr & 0xf003;
        if self.swap_lines {
            let tmp = a & 3;
            a = (a & 0xfffc) | (tmp >> 1) | ((tmp << 1) & 0x02);
        }

        match a {
            0x9000 => {
                self.pulse[0].volume = value & 0x0f;
                self.pulse[0].duty = (value & 0x70) >> 4;
                self.pulse[0].mode = value & 0x80 != 0;
            }
            0x9001 => {
                self.pulse[0].period = (self.pulse[0].period & 0xff00) | u16::from(value);
            }
            0x9002 => {
                self.pulse[0].period = (self.pulse[0].period & 0x00ff) | (u16::from(value & 0x0f) << 8);
                self.pulse_enable(0, value & 0x80 != 0, cycle, acc, config);
            }
            0x9003 => {
                self.halt = value & 0x01 != 0;
                self.period_shift = u32::from((value & 0x06) << 1);
                if self.period_shift == 0x0c {
                    self.period_shift = 0x08;
                }
            }
            0xa000 => {
                self.pulse[1].volume = value & 0x0f;
                self.pulse[1].duty = (value & 0x70) >> 4;
                self.pulse[1].mode = value & 0x80 != 0;
            }
            0xa001 => {
                self.pulse[1].period = (self.pulse[1].period & 0xff00) | u16::from(value);
            }
            0xa002 => {
                self.pulse[1].period = (self.pulse[1].period & 0x00ff) | (u16::from(value & 0x0f) << 8);
                self.pulse_enable(1, value & 0x80 != 0, cycle, acc, config);
            }
            0xb000 => {
                self.sawtooth.rate = value & 0x3f;
            }
            0xb001 => {
                self.sawtooth.period = (self.sawtooth.period & 0xff00) | u16::from(value);
            }
            0xb002 => {
                self.sawtooth.period = (self.sawtooth.period & 0x00ff) | (u16::from(value & 0x0f) << 8);
                self.sawtooth_enable(value & 0x80 != 0, cycle, acc, config);
            }
            _ => {}
        }
    }

    fn run_pulse(&mut self, channel: usize, clocks: i32, config: &NesCoreConfig) {
        let volume_pct = if channel == 0 { config.vrc6_pulse0_volume } else { config.vrc6_pulse1_volume };
        let pulse = &mut self.pulse[channel];
        let volume = i32::from(volume_pct) * i32::from(pulse.volume);

        let period_cycles = (((pulse.period >> self.period_shift) as i32) + 1) * self.apu_clock_divider as i32;

        if clocks < pulse.counter {
            pulse.counter -= clocks;
            return;
        }

        pulse.counter = period_cycles;

        let amplitude = if pulse.mode || pulse.step <= i32::from(pulse.duty) { volume / 100 } else { 0 };
        pulse.amplitude = -amplitude;

        pulse.step -= 1;
        if pulse.step < 0 {
            pulse.step = 15;
        }
    }

    fn run_sawtooth(&mut self, clocks: i32, config: &NesCoreConfig) {
        if clocks < self.sawtooth.counter {
            self.sawtooth.counter -= clocks;
            return;
        }

        let period_cycles = (((self.sawtooth.period >> self.period_shift) as i32) + 1) * self.apu_clock_divider as i32;
        self.sawtooth.counter = period_cycles;

        if self.sawtooth.step & 1 == 0 {
            if self.sawtooth.step == 0 {
                self.sawtooth.accumulator = 0;
            } else {
                self.sawtooth.accumulator = (self.sawtooth.accumulator + i32::from(self.sawtooth.rate)) & 0xff;
            }
            let amplitude = (self.sawtooth.accumulator >> 3) & 0x1f;
            let amplitude = amplitude * i32::from(config.vrc6_sawtooth_volume) / 100;
            self.sawtooth.amplitude = -amplitude;
        }

        self.sawtooth.step = (self.sawtooth.step + 1) % 14;
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let mut elapsed = cycles.wrapping_sub(self.timestamp) as i32;

        if self.halt {
            self.timestamp = cycles;
            return;
        }

        while elapsed != 0 {
            let mut clocks = -1_i32;

            if self.pulse[0].enabled {
                clocks = self.pulse[0].counter;
            }
            if self.pulse[1].enabled && (clocks < 0 || self.pulse[1].counter < clocks) {
                clocks = self.pulse[1].counter;
            }
            if self.sawtooth.enabled && (clocks < 0 || self.sawtooth.counter < clocks) {
                clocks = self.sawtooth.counter;
            }

            if clocks < 0 {
                self.timestamp = cycles;
                return;
            }

            if elapsed < clocks {
                if self.pulse[0].enabled {
                    self.pulse[0].counter -= clocks;
                }
                if self.pulse[1].enabled {
                    self.pulse[1].counter -= clocks;
                }
                if self.sawtooth.enabled {
                    self.sawtooth.counter -= clocks;
                }
                self.timestamp = self.timestamp.wrapping_add(clocks as u32);
                break;
            }

            self.timestamp = self.timestamp.wrapping_add(clocks as u32);
            elapsed -= clocks;

            if self.pulse[0].enabled {
                self.run_pulse(0, clocks, config);
            }
            if self.pulse[1].enabled {
                self.run_pulse(1, clocks, config);
            }
            if self.sawtooth.enabled {
                self.run_sawtooth(clocks, config);
            }

            self.update_amplitude(self.timestamp, acc, config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (Vrc6Audio, DeltaAccumulator, NesCoreConfig) {
        (Vrc6Audio::new(12, false), DeltaAccumulator::new(1_789_773, 48_000), NesCoreConfig::default())
    }

    #[test]
    fn digitized_mode_pulse_holds_full_volume_regardless_of_duty_step() {
        let (mut vrc6, mut acc, config) = harness();

        vrc6.write(0x9000, 0x9f, 0, &mut acc, &config); // volume 15, mode (digitized) set
        vrc6.write(0x9001, 0x00, 0, &mut acc, &config); // period low = 0
        vrc6.write(0x9002, 0x80, 0, &mut acc, &config); // period high = 0, enable

        let period_cycles = vrc6.pulse_period_cycles(&vrc6.pulse[0]) as u32;
        vrc6.run(period_cycles, &mut acc, &config);

        assert_eq!(vrc6.pulse[0].amplitude, -15);
    }

    #[test]
    fn sawtooth_accumulator_wraps_and_resets_every_fourteen_steps() {
        let (mut vrc6, mut acc, config) = harness();

        vrc6.write(0xb000, 0x3f, 0, &mut acc, &config); // max rate
        vrc6.write(0xb001, 0x00, 0, &mut acc, &config);
        vrc6.write(0xb002, 0x80, 0, &mut acc, &config); // enable

        let period_cycles = ((vrc6.sawtooth.period >> vrc6.period_shift) as i32 + 1) * 12;
        for i in 1..=15 {
            vrc6.run((period_cycles * i) as u32, &mut acc, &config);
        }

        // The 15th tick re-enters step 0 (step wraps mod 14), which resets
        // the accumulator before it advances to step 1.
        assert_eq!(vrc6.sawtooth.step, 1);
        assert_eq!(vrc6.sawtooth.accumulator, 0);
    }
}
