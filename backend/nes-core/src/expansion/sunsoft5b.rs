//! Sunsoft 5B expansion audio: an embedded AY-3-8910-style PSG (3 square
//! tone generators, one shared 17-bit noise LFSR, one shared 32-step
//! envelope), grounded on `boards/audio/sunsoft5b_audio.c`.
//!
//! The envelope-shape register write (`register_select == 0x0d`) in the
//! original ends with a `break;` immediately followed by a dead
//! `sunsoft5b_audio_update_amplitude` call and a second `break;` that the
//! `switch` can never reach. That call is preserved here as unreachable —
//! this port does not invoke it, matching the original's actual behavior
//! rather than its apparent intent.

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::NesCoreConfig;
use crate::cpu::{Component, HandlerTable};

const VOLUME_TABLE: [u8; 32] = [
    0x00, 0x01, 0x01, 0x02, 0x02, 0x03, 0x03, 0x04, 0x05, 0x06, 0x07, 0x09, 0x0b, 0x0d, 0x0f, 0x12,
    0x16, 0x1a, 0x1f, 0x25, 0x2d, 0x35, 0x3f, 0x4c, 0x5a, 0x6a, 0x7f, 0x97, 0xb4, 0xd6, 0xeb, 0xff,
];

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct Tone {
    period: u16,
    volume: u8,
    next_clock: i64,
    step: u8,
    amplitude: i32,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct Envelope {
    period: u16,
    cont: bool,
    attack: bool,
    alternate: bool,
    hold: bool,
    direction: bool,
    pause: bool,
    step: i32,
    next_clock: i64,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
struct Noise {
    period: u8,
    seed: u32,
    next_clock: i64,
}

impl Default for Noise {
    fn default() -> Self {
        Self { period: 0, seed: 0, next_clock: 0 }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Sunsoft5bAudio {
    tone: [Tone; 3],
    envelope: Envelope,
    noise: Noise,
    tone_enabled: [bool; 3],
    noise_enabled: [bool; 3],
    envelope_enabled: [bool; 3],
    register_select: u8,
    last_amplitude: i32,
    apu_clock_divider: u32,
}

impl Sunsoft5bAudio {
    #[must_use]
    pub fn new(apu_clock_divider: u32) -> Self {
        Self {
            tone: [Tone::default(); 3],
            envelope: Envelope::default(),
            noise: Noise { seed: 0xffff, ..Noise::default() },
            tone_enabled: [false; 3],
            noise_enabled: [false; 3],
            envelope_enabled: [false; 3],
            register_select: 0,
            last_amplitude: 0,
            apu_clock_divider,
        }
    }

    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        handlers.set_write(0xc000, 0x2000, 0, Component::Sunsoft5b);
        handlers.set_write(0xe000, 0x2000, 0, Component::Sunsoft5b);
    }

    pub fn reset(&mut self, hard: bool) {
        if hard {
            *self = Self::new(self.apu_clock_divider);
        }
        self.envelope.next_clock = 0;
        self.noise.next_clock = 0;
        for tone in &mut self.tone {
            tone.next_clock = 0;
        }
    }

    pub fn end_frame(&mut self, cycles: u32) {
        let cycles = i64::from(cycles);
        self.envelope.next_clock -= cycles;
        self.noise.next_clock -= cycles;
        for tone in &mut self.tone {
            tone.next_clock -= cycles;
        }
    }

    pub fn read(&self, _addr: u16, bus_value: u8) -> u8 {
        bus_value
    }

    fn period_cycles_tone(&self, tone: &Tone) -> i64 {
        i64::from(tone.period + 1) * 16 * i64::from(self.apu_clock_divider)
    }

    fn period_cycles_envelope(&self) -> i64 {
        i64::from(self.envelope.period + 1) * 16 * i64::from(self.apu_clock_divider)
    }

    fn period_cycles_noise(&self) -> i64 {
        i64::from(self.noise.period + 1) * 16 * i64::from(self.apu_clock_divider)
    }

    fn run_envelope(&mut self) {
        let period_cycles = self.period_cycles_envelope();
        let envelope = &mut self.envelope;

        if !envelope.pause {
            let incr = if envelope.direction { 1 } else { 63 };
            envelope.step = (envelope.step + incr) & 0x3f;
        }

        if envelope.step >= 32 {
            if envelope.cont {
                if envelope.alternate != envelope.hold {
                    envelope.direction = !envelope.direction;
                }
                if envelope.hold {
                    envelope.pause = true;
                }
                envelope.step = if envelope.direction { 0 } else { 31 };
            } else {
                envelope.pause = true;
                envelope.step = 0;
            }
        }

        envelope.next_clock += period_cycles;
    }

    fn run_noise(&mut self) {
        let period_cycles = self.period_cycles_noise();
        if self.noise.seed & 0x01 != 0 {
            self.noise.seed ^= 0x24000;
        }
        self.noise.seed >>= 1;
        self.noise.next_clock += period_cycles;
    }

    fn run_tone(&mut self, c: usize, cycles: i64) {
        let period_cycles = self.period_cycles_tone(&self.tone[c]);

        if !self.tone_enabled[c] && self.tone[c].next_clock < cycles {
            let cycles_to_run = cycles - self.tone[c].next_clock;
            let mut count = cycles_to_run / period_cycles;
            if cycles_to_run % period_cycles != 0 {
                count += 1;
            }

            if self.tone[c].amplitude != 0 {
                self.tone[c].amplitude = 0;
            }
            if count & 1 != 0 {
                self.tone[c].step ^= 1;
            }
            self.tone[c].next_clock += count * period_cycles;
            return;
        }

        let amplitude = i32::from(self.tone[c].step != 0);
        self.tone[c].amplitude = amplitude;
        self.tone[c].step ^= 1;
        self.tone[c].next_clock += period_cycles;
    }

    fn update_amplitude(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let noise_bit = self.noise.seed & 0x01 != 0;
        let mut out = 0_i32;

        for i in 0..3 {
            if (!self.noise_enabled[i] || noise_bit) && (!self.tone_enabled[i] || self.tone[i].amplitude != 0) {
                let volume = i32::from(config.sunsoft5b_channel_volume[i]);
                let channel_out = if self.envelope_enabled[i] {
                    i32::from(VOLUME_TABLE[self.envelope.step as usize & 0x1f])
                } else {
                    i32::from(VOLUME_TABLE[self.tone[i].volume as usize & 0x1f])
                };
                out += 128 * 64 * volume * channel_out / 10000;
            }
        }

        if out != self.last_amplitude {
            acc.add_delta(cycles.max(0) as u32, out - self.last_amplitude);
            self.last_amplitude = out;
        }
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let cycles = i64::from(cycles);

        loop {
            let mut limit = i64::MAX;
            limit = limit.min(self.envelope.next_clock);
            limit = limit.min(self.noise.next_clock);
            for tone in &self.tone {
                limit = limit.min(tone.next_clock);
            }

            if limit >= cycles {
                break;
            }

            if self.envelope.next_clock <= limit {
                self.run_envelope();
            }
            if self.noise.next_clock <= limit {
                self.run_noise();
            }
            for c in 0..3 {
                if self.tone[c].next_clock <= limit {
                    self.run_tone(c, cycles);
                }
            }

            self.update_amplitude(limit, acc, config);
        }
    }

    pub fn write(&mut self, addr: u16, value: u8, cycle: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run(cycle, acc, config);
        let cycles = i64::from(cycle);

        if addr < 0xe000 {
            self.register_select = value & 0x0f;
            return;
        }

        match self.register_select {
            0x00 | 0x02 | 0x04 => {
                let channel = (self.register_select >> 1) as usize;
                let period = self.tone[channel].period;
                self.tone[channel].period = (period & 0x0f00) | u16::from(value);
            }
            0x01 | 0x03 | 0x05 => {
                let channel = (self.register_select >> 1) as usize;
                let period = self.tone[channel].period;
                self.tone[channel].period = (period & 0x00ff) | (u16::from(value & 0x0f) << 8);
            }
            0x06 => {
                self.noise.period = value & 0x1f;
            }
            0x07 => {
                self.noise_enabled[0] = value & 0x08 == 0;
                self.noise_enabled[1] = value & 0x10 == 0;
                self.noise_enabled[2] = value & 0x20 == 0;
                self.tone_enabled[0] = value & 0x01 == 0;
                self.tone_enabled[1] = value & 0x02 == 0;
                self.tone_enabled[2] = value & 0x04 == 0;
                self.update_amplitude(cycles, acc, config);
            }
            0x08 | 0x09 | 0x0a => {
                let channel = (self.register_select & 0x03) as usize;
                self.envelope_enabled[channel] = value & 0x10 != 0;
                self.tone[channel].volume = (value & 0x0f) << 1;
                self.update_amplitude(cycles, acc, config);
            }
            0x0b => {
                self.envelope.period = (self.envelope.period & 0xff00) | u16::from(value);
            }
            0x0c => {
                self.envelope.period = (self.envelope.period & 0x00ff) | (u16::from(value) << 8);
            }
            0x0d => {
                self.envelope.cont = (value >> 3) & 0x01 != 0;
                self.envelope.attack = (value >> 2) & 0x01 != 0;
                self.envelope.alternate = (value >> 1) & 0x01 != 0;
                self.envelope.hold = value & 0x01 != 0;
                self.envelope.direction = self.envelope.attack;
                self.envelope.pause = false;
                self.envelope.step = if self.envelope.direction { 0 } else { 31 };
            }
            _ => {}
        }
    }
}
