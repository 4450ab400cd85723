//! MMC5 expansion audio: two square-wave channels with their own envelope
//! and length counter (independent of the base APU's channels) plus a
//! direct PCM sample channel, grounded on `boards/audio/mmc5_audio.c`.
//!
//! PCM read mode works by installing a read handler across `$8000-$BFFF`.
//! The core's read dispatch resolves page-table banks before handler
//! overrides run, so by the time `read` below sees `bus_value` it already
//! holds the PRG-ROM byte at that address, peeked without side effects —
//! exactly what `mmc5_audio_pcm_read_handler`'s explicit `cpu_peek` call
//! produces in the original. A zero byte schedules the PCM IRQ instead of
//! updating the sample.

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::{NesCoreConfig, TimingMode};
use crate::cpu::{Component, CpuState, HandlerTable, IrqLine};

const LENGTH_TABLE: [u8; 0x20] = [
    0x0A, 0xFE, 0x14, 0x02, 0x28, 0x04, 0x50, 0x06, 0xA0, 0x08, 0x3C, 0x0A, 0x0E, 0x0C, 0x1A, 0x0E,
    0x0C, 0x10, 0x18, 0x12, 0x30, 0x14, 0x60, 0x16, 0xC0, 0x18, 0x48, 0x1A, 0x10, 0x1C, 0x20, 0x1E,
];

const FRAME_COUNTER_PERIOD_NTSC: i64 = 7458;
const FRAME_COUNTER_PERIOD_PAL: i64 = 6928;
const FRAME_COUNTER_PERIOD_DENDY: i64 = 7390;

const PCM_READ_MODE_ADDR: u16 = 0x8000;
const PCM_READ_MODE_SIZE: u32 = 0x4000;

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct Pulse {
    counter: u32,
    envelope_period: i32,
    envelope_delay: i32,
    envelope_counter: i32,
    period: u16,
    duty_cycle: u8,
    phase: i32,
    amplitude: i32,
    enabled: bool,
    counter_halt_flag: bool,
    loop_flag: bool,
    start_flag: bool,
    constant_flag: bool,
    next_clock: i64,
}

fn pulse_volume(pulse: &Pulse) -> i32 {
    if pulse.counter == 0 {
        0
    } else if pulse.constant_flag {
        pulse.envelope_period - 1
    } else {
        pulse.envelope_counter
    }
}

fn clock_envelope(pulse: &mut Pulse) {
    if pulse.start_flag {
        pulse.start_flag = false;
        pulse.envelope_delay = pulse.envelope_period;
        pulse.envelope_counter = 15;
    } else {
        pulse.envelope_delay -= 1;
        if pulse.envelope_delay == 0 {
            pulse.envelope_delay = pulse.envelope_period;
            if pulse.envelope_counter != 0 {
                pulse.envelope_counter -= 1;
            } else if pulse.loop_flag {
                pulse.envelope_counter = 15;
            }
        }
    }
}

fn clock_length(pulse: &mut Pulse) {
    if pulse.counter != 0 && !pulse.counter_halt_flag {
        pulse.counter -= 1;
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Mmc5Audio {
    pulse: [Pulse; 2],
    next_frame_clock: i64,
    frame_counter_period: i64,
    pcm_irq_enabled: bool,
    pcm_irq_fired: u8,
    pcm_read_mode: bool,
    pcm: u8,
    last_amplitude: i32,
    apu_clock_divider: i64,
}

impl Mmc5Audio {
    #[must_use]
    pub fn new(apu_clock_divider: u32, timing_mode: TimingMode) -> Self {
        let mut audio = Self {
            pulse: [Pulse::default(); 2],
            next_frame_clock: 0,
            frame_counter_period: frame_counter_period(timing_mode),
            pcm_irq_enabled: false,
            pcm_irq_fired: 0,
            pcm_read_mode: false,
            pcm: 0,
            last_amplitude: 0,
            apu_clock_divider: i64::from(apu_clock_divider),
        };
        audio.reset(true);
        audio
    }

    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        for i in 0..4 {
            handlers.set_write(0x5000 + i, 1, 0, Component::Mmc5);
            handlers.set_write(0x5004 + i, 1, 0, Component::Mmc5);
        }
        handlers.set_write(0x5010, 1, 0, Component::Mmc5);
        handlers.set_read(0x5010, 1, 0, Component::Mmc5);
        handlers.set_write(0x5011, 1, 0, Component::Mmc5);
        handlers.set_write(0x5015, 1, 0, Component::Mmc5);
        handlers.set_read(0x5015, 1, 0, Component::Mmc5);
    }

    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.pulse = [Pulse::default(); 2];
            self.pcm_irq_enabled = false;
            self.pcm_irq_fired = 0;
            self.pcm_read_mode = false;
            self.pcm = 0;
            self.pulse[0].envelope_delay = 1;
            self.pulse[1].envelope_delay = 1;
            self.pulse[0].envelope_period = 1;
            self.pulse[1].envelope_period = 1;
        }
        self.next_frame_clock = self.frame_counter_period;
        self.pulse[0].next_clock = 0;
        self.pulse[1].next_clock = 0;
    }

    pub fn end_frame(&mut self, cycles: u32) {
        let cycles = i64::from(cycles);
        self.next_frame_clock -= cycles;
        self.pulse[0].next_clock -= cycles;
        self.pulse[1].next_clock -= cycles;
    }

    fn pcm_read_mode_enable(&mut self, enabled: bool, cpu: &mut CpuState) {
        if self.pcm_read_mode == enabled {
            return;
        }
        self.pcm_read_mode = enabled;
        if enabled {
            cpu.handlers.set_read(PCM_READ_MODE_ADDR, PCM_READ_MODE_SIZE, 0, Component::Mmc5);
        } else {
            cpu.handlers.clear_read(PCM_READ_MODE_ADDR, PCM_READ_MODE_SIZE, 0);
        }
    }

    fn update_amplitude(&mut self, cycles: i64, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let p0 = i64::from(self.pulse[0].amplitude) * i64::from(config.mmc5_pulse0_volume);
        let p1 = i64::from(self.pulse[1].amplitude) * i64::from(config.mmc5_pulse1_volume);
        let pulse_tmp = p0 + p1;
        let pulse_out = if pulse_tmp != 0 { (65536 * 9552) / (100 * 812800 / pulse_tmp + 10000) } else { 0 };

        let pcm_tmp = i64::from(self.pcm) * 64 * i64::from(config.mmc5_pcm_volume);
        let pcm_out = pcm_tmp / 100;

        let out = (pulse_out + pcm_out) as i32;
        // Unlike the other expansion chips, the mixer delta here is
        // negated relative to `out - last_amplitude`, matching the source.
        let delta = -(out - self.last_amplitude);
        self.last_amplitude = out;

        if delta != 0 {
            acc.add_delta(cycles.max(0) as u32, delta);
        }
    }

    fn run_pulse(&mut self, c: usize, limit: i64) {
        let period_cycles = (i64::from(self.pulse[c].period) + 1) * 2 * self.apu_clock_divider;
        let pulse = &mut self.pulse[c];
        let volume = pulse_volume(pulse);
        let mut duty = 1_i32 << pulse.duty_cycle;
        if pulse.duty_cycle == 3 {
            duty = 2;
        }
        let muted = volume == 0 || pulse.period < 8;

        if muted {
            let cycles_to_run = limit - pulse.next_clock;
            let mut count = cycles_to_run / period_cycles;
            if cycles_to_run % period_cycles != 0 {
                count += 1;
            }
            pulse.phase = ((i64::from(pulse.phase) + count) % 8) as i32;
            pulse.next_clock += count * period_cycles;
            pulse.amplitude = 0;
            return;
        }

        pulse.phase = (pulse.phase + 1) % 8;
        if pulse.phase == 0 || pulse.phase == duty {
            let delta = if pulse.amplitude != 0 { -volume } else { volume };
            pulse.amplitude += delta;
        }
        pulse.next_clock += period_cycles;
    }

    fn run_frame(&mut self) {
        clock_envelope(&mut self.pulse[0]);
        clock_envelope(&mut self.pulse[1]);
        clock_length(&mut self.pulse[0]);
        clock_length(&mut self.pulse[1]);
        self.next_frame_clock += self.frame_counter_period;
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let cycles = i64::from(cycles);

        loop {
            let mut limit = self.next_frame_clock;
            limit = limit.min(self.pulse[0].next_clock);
            limit = limit.min(self.pulse[1].next_clock);

            if limit >= cycles {
                break;
            }

            if self.pulse[0].next_clock <= limit {
                self.run_pulse(0, limit);
            }
            if self.pulse[1].next_clock <= limit {
                self.run_pulse(1, limit);
            }
            if self.next_frame_clock <= limit {
                self.run_frame();
            }

            self.update_amplitude(limit, acc, config);
        }
    }

    pub fn read(
        &mut self,
        addr: u16,
        cycle: u32,
        bus_value: u8,
        acc: &mut DeltaAccumulator,
        config: &NesCoreConfig,
        cpu: &mut CpuState,
    ) -> u8 {
        self.run(cycle, acc, config);

        if self.pcm_read_mode && (PCM_READ_MODE_ADDR..PCM_READ_MODE_ADDR.wrapping_add(PCM_READ_MODE_SIZE as u16)).contains(&addr) {
            if bus_value != 0 {
                self.pcm = bus_value;
                self.update_amplitude(i64::from(cycle), acc, config);
            } else if self.pcm_irq_enabled {
                cpu.interrupt_schedule(IrqLine::Mmc5Pcm, cycle);
                self.pcm_irq_fired = 0x80;
            }
            return bus_value;
        }

        match addr {
            0x5010 => {
                let result = (bus_value & 0x7f) | self.pcm_irq_fired;
                self.pcm_irq_fired = 0;
                cpu.interrupt_ack(IrqLine::Mmc5Pcm);
                result
            }
            0x5015 => {
                let mut result = bus_value & 0xfc;
                if self.pulse[0].counter != 0 {
                    result |= 0x01;
                }
                if self.pulse[1].counter != 0 {
                    result |= 0x02;
                }
                result
            }
            _ => bus_value,
        }
    }

    pub fn write(
        &mut self,
        addr: u16,
        value: u8,
        cycle: u32,
        acc: &mut DeltaAccumulator,
        config: &NesCoreConfig,
        cpu: &mut CpuState,
    ) {
        self.run(cycle, acc, config);
        let cycles = i64::from(cycle);

        match addr {
            0x5000 | 0x5004 => {
                let c = usize::from((addr - 0x5000) / 4);
                self.pulse[c].duty_cycle = (value & 0xc0) >> 6;
                self.pulse[c].counter_halt_flag = value & 0x20 != 0;
                self.pulse[c].loop_flag = value & 0x20 != 0;
                self.pulse[c].constant_flag = value & 0x10 != 0;
                self.pulse[c].envelope_period = i32::from(value & 0x0f) + 1;
                self.update_amplitude(cycles, acc, config);
            }
            0x5001 | 0x5005 => {}
            0x5002 | 0x5006 => {
                let c = usize::from((addr - 0x5000) / 4);
                self.pulse[c].period = (self.pulse[c].period & 0x0700) | u16::from(value);
            }
            0x5003 | 0x5007 => {
                let c = usize::from((addr - 0x5000) / 4);
                self.pulse[c].period = (self.pulse[c].period & 0x00ff) | (u16::from(value & 0x07) << 8);
                if self.pulse[c].enabled {
                    self.pulse[c].counter = u32::from(LENGTH_TABLE[usize::from((value >> 3) & 0x1f)]);
                }
                self.pulse[c].start_flag = true;
                self.pulse[c].phase = 0;
            }
            0x5010 => {
                self.pcm_irq_enabled = value & 0x80 != 0;
                self.pcm_read_mode_enable(value & 0x01 != 0, cpu);
            }
            0x5011 => {
                if !self.pcm_read_mode && value != 0 {
                    self.pcm = value;
                    self.update_amplitude(cycles, acc, config);
                }
            }
            0x5015 => {
                self.pulse[0].enabled = value & 0x01 != 0;
                if !self.pulse[0].enabled {
                    self.pulse[0].counter = 0;
                }
                self.pulse[1].enabled = value & 0x02 != 0;
                if !self.pulse[1].enabled {
                    self.pulse[1].counter = 0;
                }
            }
            _ => {}
        }
    }
}

fn frame_counter_period(timing_mode: TimingMode) -> i64 {
    match timing_mode {
        TimingMode::Ntsc => FRAME_COUNTER_PERIOD_NTSC,
        TimingMode::Pal => FRAME_COUNTER_PERIOD_PAL,
        TimingMode::Dendy => FRAME_COUNTER_PERIOD_DENDY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::irq_mask;

    fn harness() -> (Mmc5Audio, CpuState, DeltaAccumulator, NesCoreConfig) {
        (
            Mmc5Audio::new(12, TimingMode::Ntsc),
            CpuState::new(12),
            DeltaAccumulator::new(1_789_773, 48_000),
            NesCoreConfig::default(),
        )
    }

    #[test]
    fn pcm_read_mode_zero_byte_schedules_irq_instead_of_updating_sample() {
        let (mut mmc5, mut cpu, mut acc, config) = harness();

        mmc5.write(0x5010, 0x81, 0, &mut acc, &config, &mut cpu); // IRQ enable + PCM read mode
        assert!(mmc5.pcm_read_mode);

        mmc5.pcm = 0x55;
        mmc5.read(0x8000, 100, 0, &mut acc, &config, &mut cpu);

        assert_eq!(mmc5.pcm, 0x55, "a zero sample byte must not overwrite the held PCM value");
        assert_eq!(mmc5.pcm_irq_fired, 0x80);
        assert_ne!(cpu.interrupts & irq_mask(IrqLine::Mmc5Pcm), 0);

        let status = mmc5.read(0x5010, 101, 0x00, &mut acc, &config, &mut cpu);
        assert_eq!(status & 0x80, 0x80);
        assert_eq!(mmc5.pcm_irq_fired, 0);
    }

    #[test]
    fn pcm_read_mode_nonzero_byte_updates_the_held_sample() {
        let (mut mmc5, mut cpu, mut acc, config) = harness();

        mmc5.write(0x5010, 0x01, 0, &mut acc, &config, &mut cpu); // PCM read mode, IRQ disabled
        mmc5.read(0x8000, 50, 0x7f, &mut acc, &config, &mut cpu);

        assert_eq!(mmc5.pcm, 0x7f);
    }

    #[test]
    fn direct_pcm_write_is_ignored_while_read_mode_is_active() {
        let (mut mmc5, mut cpu, mut acc, config) = harness();

        mmc5.write(0x5010, 0x01, 0, &mut acc, &config, &mut cpu);
        mmc5.write(0x5011, 0x42, 1, &mut acc, &config, &mut cpu);

        assert_eq!(mmc5.pcm, 0, "direct writes to $5011 are only honored outside PCM read mode");
    }
}
