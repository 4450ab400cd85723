//! Famicom Disk System expansion audio: a wavetable channel modulated by a
//! second wavetable-driven pitch sweep, plus independent volume/sweep
//! envelope units, grounded on `boards/audio/fds_audio.c`. Each subunit
//! catches the others up in a fixed cascade — modulator drives sweep drives
//! wave drives volume — rather than the "soonest next event wins" scheduling
//! the other expansion chips use; this mirrors the original's call chain
//! exactly (`modulator_run` -> `sweep_run` -> `wave_run` -> `volume_run`).

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::NesCoreConfig;
use crate::cpu::{Component, HandlerTable};

/// Size of a real Famicom Disk System BIOS ROM image, mapped fixed at
/// `$E000-$FFFF`. Checked at core construction time (§10.2); this module
/// otherwise never touches the BIOS image itself, since mapping it into
/// the page table is the host's job, same as any other ROM bank.
pub const FDS_BIOS_SIZE: usize = 0x2000;

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct VolumeUnit {
    timestamp: i64,
    enabled: bool,
    increase: bool,
    speed: i32,
    gain: i32,
    period: i32,
    counter: i32,
    last_amplitude: i32,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct SweepUnit {
    timestamp: i64,
    enabled: bool,
    increase: bool,
    speed: i32,
    gain: i32,
    period: i32,
    counter: i32,
}

#[derive(Debug, Clone, Encode, Decode)]
struct ModulatorUnit {
    timestamp: i64,
    table: [u8; 64],
    accumulator: i32,
    pitch: i32,
    step: usize,
    enabled: bool,
    sweep_bias: i32,
}

impl Default for ModulatorUnit {
    fn default() -> Self {
        Self {
            timestamp: 0,
            table: [0; 64],
            accumulator: 0,
            pitch: 0,
            step: 0,
            enabled: false,
            sweep_bias: 0,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
struct WaveUnit {
    timestamp: i64,
    table: [u8; 64],
    accumulator: i32,
    pitch: i32,
    step: usize,
    enabled: bool,
    writable: bool,
    master_volume: usize,
    unmodulated_pitch: i32,
    last_value: u8,
}

impl Default for WaveUnit {
    fn default() -> Self {
        Self {
            timestamp: 0,
            table: [0; 64],
            accumulator: 0,
            pitch: 0,
            step: 0,
            enabled: false,
            writable: false,
            master_volume: 0,
            unmodulated_pitch: 0,
            last_value: 0,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct FdsAudio {
    volume: VolumeUnit,
    sweep: SweepUnit,
    modulator: ModulatorUnit,
    wave: WaveUnit,
    envelopes_enabled: bool,
    envelopes_speed: i32,
    enabled: bool,
    apu_clock_divider: u32,
}

const MOD_ADJUST: [i32; 8] = [0, 1, 2, 4, 0, -4, -2, -1];

impl FdsAudio {
    #[must_use]
    pub fn new(apu_clock_divider: u32) -> Self {
        Self {
            volume: VolumeUnit::default(),
            sweep: SweepUnit::default(),
            modulator: ModulatorUnit::default(),
            wave: WaveUnit::default(),
            envelopes_enabled: false,
            envelopes_speed: 0,
            enabled: false,
            apu_clock_divider,
        }
    }

    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        handlers.set_read(0x4040, 64, 0, Component::Fds);
        handlers.set_write(0x4040, 64, 0, Component::Fds);
        handlers.set_write(0x4080, 1, 0, Component::Fds);
        handlers.set_write(0x4082, 9, 0, Component::Fds);
        handlers.set_read(0x4090, 1, 0, Component::Fds);
        handlers.set_read(0x4092, 1, 0, Component::Fds);
    }

    pub fn reset(&mut self, hard: bool) {
        self.modulator.timestamp = 0;
        self.wave.timestamp = 0;
        self.sweep.timestamp = 0;
        self.volume.timestamp = 0;

        if hard {
            self.volume = VolumeUnit::default();
            self.sweep = SweepUnit::default();
            self.modulator = ModulatorUnit::default();
            self.wave = WaveUnit::default();
            self.envelopes_enabled = false;
            self.envelopes_speed = 0;
        }

        // FIXME Should anything happen on a soft reset?
    }

    pub fn end_frame(&mut self, cycles: u32) {
        let cycles = i64::from(cycles);
        self.modulator.timestamp -= cycles;
        self.wave.timestamp -= cycles;
        self.sweep.timestamp -= cycles;
        self.volume.timestamp -= cycles;
    }

    fn update_amplitude(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        const MAX_OUTPUT: f64 = 63.0 * 32.0;
        const MASTER_VOLUME: f64 = 2.4 * 9752.0;
        let master_vol = [
            ((MASTER_VOLUME / MAX_OUTPUT) * 256.0 * 2.0 / 2.0) as i32,
            ((MASTER_VOLUME / MAX_OUTPUT) * 256.0 * 2.0 / 3.0) as i32,
            ((MASTER_VOLUME / MAX_OUTPUT) * 256.0 * 2.0 / 4.0) as i32,
            ((MASTER_VOLUME / MAX_OUTPUT) * 256.0 * 2.0 / 5.0) as i32,
        ];

        let amp = if self.volume.gain != 0 {
            let mut amp = self.volume.gain.min(32);
            amp *= master_vol[self.wave.master_volume];
            amp *= if self.wave.writable {
                i32::from(self.wave.last_value)
            } else {
                i32::from(self.wave.table[self.wave.step])
            };
            amp *= i32::from(config.fds_volume);
            amp /= 100;
            amp >>= 8;
            amp
        } else {
            0
        };

        let delta = amp - self.volume.last_amplitude;
        if delta != 0 {
            acc.add_delta(cycles.max(0) as u32, delta);
            self.volume.last_amplitude = amp;
        }
    }

    fn update_mod(&mut self) {
        let mut tmp = self.modulator.sweep_bias * self.sweep.gain;
        let remainder = tmp & 0x0f;
        tmp >>= 4;

        if remainder != 0 && tmp & 0x80 == 0 {
            if self.modulator.sweep_bias < 0 {
                tmp -= 1;
            } else {
                tmp += 2;
            }
        }

        if tmp >= 192 {
            tmp -= 256;
        } else if tmp < -64 {
            tmp += 256;
        }

        let mut tmp = self.wave.unmodulated_pitch * tmp;
        let remainder = tmp & 0x3f;
        tmp >>= 6;
        if remainder >= 32 {
            tmp += 1;
        }

        self.wave.pitch = self.wave.unmodulated_pitch + tmp;
    }

    fn run_volume(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if !self.wave.enabled || !self.envelopes_enabled || !self.volume.enabled || self.volume.period == 0 {
            self.volume.timestamp = cycles;
            return;
        }

        let mut remaining = (cycles - self.volume.timestamp) / i64::from(self.apu_clock_divider);

        while remaining > 0 {
            let ticks = (self.volume.period - self.volume.counter).min(remaining as i32);

            self.volume.timestamp += i64::from(ticks) * i64::from(self.apu_clock_divider);
            self.volume.counter += ticks;

            if self.volume.counter == self.volume.period {
                self.volume.counter = 0;
                if self.volume.increase && self.volume.gain < 32 {
                    self.volume.gain += 1;
                } else if !self.volume.increase && self.volume.gain > 0 {
                    self.volume.gain -= 1;
                }
                self.update_amplitude(self.volume.timestamp, acc, config);
            }

            remaining -= i64::from(ticks);
        }
    }

    fn run_wave(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if !self.wave.enabled || self.wave.pitch == 0 {
            self.wave.timestamp = cycles;
            self.run_volume(cycles, acc, config);
            return;
        }

        let mut remaining = (cycles - self.wave.timestamp) / i64::from(self.apu_clock_divider);

        while remaining > 0 {
            let acc_remaining = 65536 - self.wave.accumulator;
            let mut ticks = acc_remaining / self.wave.pitch;
            if acc_remaining % self.wave.pitch != 0 {
                ticks += 1;
            }
            let clocks = ticks.min(remaining as i32);

            self.wave.accumulator += clocks * self.wave.pitch;
            self.wave.timestamp += i64::from(clocks) * i64::from(self.apu_clock_divider);
            remaining -= i64::from(clocks);

            self.run_volume(self.wave.timestamp, acc, config);

            if self.wave.accumulator >= 65536 {
                self.wave.accumulator &= 0xffff;
                self.wave.step = (self.wave.step + 1) & 0x3f;
                self.update_amplitude(self.wave.timestamp, acc, config);
            }
        }
    }

    fn run_sweep(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if !self.wave.enabled || !self.envelopes_enabled || !self.sweep.enabled || self.sweep.period == 0 {
            self.sweep.timestamp = cycles;
            self.run_wave(cycles, acc, config);
            return;
        }

        let mut remaining = (cycles - self.sweep.timestamp) / i64::from(self.apu_clock_divider);

        while remaining > 0 {
            let ticks = (self.sweep.period - self.sweep.counter).min(remaining as i32);

            self.sweep.timestamp += i64::from(ticks) * i64::from(self.apu_clock_divider);
            self.sweep.counter += ticks;
            self.run_wave(self.sweep.timestamp, acc, config);

            if self.sweep.counter == self.sweep.period {
                self.sweep.counter = 0;
                if self.sweep.increase && self.sweep.gain < 32 {
                    self.sweep.gain += 1;
                } else if !self.sweep.increase && self.sweep.gain > 0 {
                    self.sweep.gain -= 1;
                }
                self.update_mod();
            }

            remaining -= i64::from(ticks);
        }
    }

    fn run_modulator(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        if !self.modulator.enabled || self.modulator.pitch == 0 {
            self.modulator.timestamp = cycles;
            self.run_sweep(cycles, acc, config);
            return;
        }

        let mut remaining = (cycles - self.modulator.timestamp) / i64::from(self.apu_clock_divider);

        while remaining > 0 {
            let acc_remaining = 65536 - self.modulator.accumulator;
            let mut ticks = acc_remaining / self.modulator.pitch;
            if acc_remaining % self.modulator.pitch != 0 {
                ticks += 1;
            }
            let clocks = ticks.min(remaining as i32);

            self.modulator.accumulator += clocks * self.modulator.pitch;
            self.modulator.timestamp += i64::from(clocks) * i64::from(self.apu_clock_divider);
            remaining -= i64::from(clocks);

            self.run_sweep(self.modulator.timestamp, acc, config);

            if self.modulator.accumulator >= 65536 {
                self.modulator.accumulator &= 0xffff;

                let tmp = self.modulator.table[self.modulator.step];
                self.modulator.step = (self.modulator.step + 1) & 0x3f;

                if tmp == 4 {
                    self.modulator.sweep_bias = 0;
                } else {
                    self.modulator.sweep_bias += MOD_ADJUST[tmp as usize];
                }

                if self.modulator.sweep_bias > 63 {
                    self.modulator.sweep_bias -= 128;
                } else if self.modulator.sweep_bias < -64 {
                    self.modulator.sweep_bias += 128;
                }

                self.update_mod();
            }
        }
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run_modulator(i64::from(cycles), acc, config);
    }

    pub fn read(&mut self, addr: u16, cycle: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig, bus_value: u8) -> u8 {
        self.run(cycle, acc, config);

        if !self.enabled {
            return 0;
        }

        let data = if (0x4040..0x4080).contains(&addr) {
            self.wave.table[(addr - 0x4040) as usize]
        } else {
            match addr {
                0x4090 => self.volume.gain as u8,
                0x4092 => self.sweep.gain as u8,
                _ => bus_value,
            }
        };

        (bus_value & 0xc0) | data
    }

    pub fn write(&mut self, addr: u16, value: u8, cycle: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run(cycle, acc, config);

        if !self.enabled {
            return;
        }

        if (0x4040..0x4080).contains(&addr) {
            if self.wave.writable {
                self.wave.table[(addr - 0x4040) as usize] = value & 0x3f;
            }
            return;
        }

        match addr {
            0x4080 => {
                self.volume.increase = value & 0x40 != 0;
                self.volume.enabled = value & 0x80 == 0;
                self.volume.speed = i32::from(value & 0x3f);
                if !self.volume.enabled {
                    self.volume.gain = i32::from(value & 0x3f);
                }
                self.volume.counter = 0;
                self.volume.period = (self.volume.speed + 1) * 8 * self.envelopes_speed;
                self.update_amplitude(i64::from(cycle), acc, config);
            }
            0x4082 => {
                self.wave.unmodulated_pitch = (self.wave.unmodulated_pitch & 0xff00) | i32::from(value);
                self.update_mod();
            }
            0x4083 => {
                self.wave.unmodulated_pitch = (self.wave.unmodulated_pitch & 0x00ff) | (i32::from(value & 0x0f) << 8);
                self.envelopes_enabled = value & 0x40 == 0;
                if !self.envelopes_enabled {
                    self.volume.counter = 0;
                    self.sweep.counter = 0;
                }
                if value & 0x80 != 0 {
                    self.wave.step = 0;
                    self.wave.accumulator = 0;
                }
                self.wave.enabled = value & 0x80 == 0;

                self.update_amplitude(i64::from(cycle), acc, config);
                self.update_mod();
            }
            0x4084 => {
                self.sweep.increase = value & 0x40 != 0;
                self.sweep.enabled = value & 0x80 == 0;
                self.sweep.speed = i32::from(value & 0x3f);
                if !self.sweep.enabled {
                    self.sweep.gain = i32::from(value & 0x3f);
                }
                self.sweep.counter = 0;
                self.sweep.period = (self.sweep.speed + 1) * 8 * self.envelopes_speed;
                self.update_mod();
            }
            0x4085 => {
                let mut bias = i32::from(value & 0x7f);
                if bias >= 0x40 {
                    bias -= 127;
                }
                self.modulator.sweep_bias = bias;
                self.update_mod();
            }
            0x4086 => {
                self.modulator.pitch = (self.modulator.pitch & 0xff00) | i32::from(value);
                self.update_mod();
            }
            0x4087 => {
                self.modulator.pitch = (self.modulator.pitch & 0x00ff) | (i32::from(value & 0x0f) << 8);
                self.modulator.enabled = value & 0x80 == 0;
                if value & 0x80 != 0 {
                    self.modulator.accumulator = 0;
                }
                self.update_mod();
            }
            0x4088 => {
                if !self.modulator.enabled {
                    let value = value & 0x07;
                    let index = self.modulator.step;
                    self.modulator.table[index] = value;
                    let index = (index + 1) & 0x3f;
                    self.modulator.table[index] = value;
                    self.modulator.step = (index + 1) & 0x3f;
                }
            }
            0x4089 => {
                self.wave.writable = value & 0x80 != 0;
                self.wave.last_value = self.wave.table[self.wave.step];
                self.wave.master_volume = (value & 0x03) as usize;
                self.update_amplitude(i64::from(cycle), acc, config);
            }
            0x408a => {
                self.envelopes_speed = i32::from(value);
                self.volume.counter = 0;
                self.sweep.counter = 0;
                self.volume.period = (self.volume.speed + 1) * 8 * self.envelopes_speed;
                self.sweep.period = (self.sweep.speed + 1) * 8 * self.envelopes_speed;
            }
            _ => {}
        }
    }

    pub fn set_enabled(&mut self, cycle: u32, enabled: bool, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run(cycle, acc, config);
        self.enabled = enabled;
    }
}
