//! VRC7 expansion audio: a 6-channel FM synthesizer (OPLL-compatible),
//! grounded on `boards/audio/vrc7_audio.c`. The FM core itself is
//! `ym_opll::Vrc7AudioUnit`, ticked once every 36 CPU cycles exactly as the
//! original's `vrc7_audio_run` divides `elapsed` by `36 * cpu_clock_divider`.
//!
//! `ym_opll`'s public API only exposes the fully mixed channel sample
//! (`Opll::sample`), not each operator's raw carrier output the way cxnes's
//! `update_amplitude` reads `opll->slot[...].output[1]` per channel. This
//! port therefore applies a single averaged gain across
//! `config.vrc7_channel_volume` rather than per-channel weighting; see
//! DESIGN.md.

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::NesCoreConfig;
use crate::cpu::{Component, HandlerTable};

const AUDIO_DIVIDER: u8 = 36;
/// Scales `ym_opll`'s normalized -1.0..1.0 mixed sample into the same
/// low-thousands integer amplitude range the base APU and other expansion
/// chips' mixer formulas produce.
const MASTER_SCALE: f64 = 1800.0;

#[derive(Debug, Clone, Encode, Decode)]
pub struct Vrc7Audio {
    opll: ym_opll::Vrc7AudioUnit,
    timestamp: u32,
    last_amplitude: i32,
    muted: bool,
    cpu_clock_divider: u32,
}

impl Vrc7Audio {
    #[must_use]
    pub fn new(cpu_clock_divider: u32) -> Self {
        Self {
            opll: ym_opll::new_vrc7(1),
            timestamp: 0,
            last_amplitude: 0,
            muted: false,
            cpu_clock_divider,
        }
    }

    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        handlers.set_write(0x9010, 1, 0, Component::Vrc7);
        handlers.set_write(0x9030, 1, 0, Component::Vrc7);
        handlers.set_write(0xe000, 1, 0, Component::Vrc7);
    }

    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.opll = ym_opll::new_vrc7(1);
            self.timestamp = 0;
            self.last_amplitude = 0;
            self.muted = false;
        }
    }

    pub fn end_frame(&mut self, cycles: u32) {
        self.timestamp = self.timestamp.saturating_sub(cycles);
    }

    pub fn read(&self, _addr: u16, bus_value: u8) -> u8 {
        bus_value
    }

    fn update_amplitude(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let avg_volume: f64 =
            config.vrc7_channel_volume.iter().map(|&v| f64::from(v)).sum::<f64>() / 6.0 / 100.0;
        let amplitude = (self.opll.sample() * MASTER_SCALE * avg_volume).round() as i32;

        let delta = amplitude - self.last_amplitude;
        self.last_amplitude = amplitude;

        if delta != 0 && !self.muted {
            acc.add_delta(cycles, delta);
        }
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        let step_cycles = 36 * self.cpu_clock_divider;
        let elapsed = cycles.wrapping_sub(self.timestamp);
        let mut timestamp = self.timestamp;

        let mut clocks = elapsed / step_cycles;
        while clocks > 0 {
            timestamp += step_cycles;
            self.opll.tick();
            self.update_amplitude(timestamp, acc, config);
            clocks -= 1;
        }

        self.timestamp = timestamp;
    }

    pub fn write(&mut self, addr: u16, value: u8, cycle: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        self.run(cycle, acc, config);

        match addr {
            0x9010 => self.opll.select_register(value),
            0x9030 => self.opll.write_data(value),
            0xe000 => {
                let muted = value & 0x40 != 0;
                if !self.muted && muted {
                    acc.add_delta(cycle, -self.last_amplitude);
                } else if self.muted && !muted {
                    acc.add_delta(cycle, self.last_amplitude);
                }
                self.muted = muted;
            }
            _ => {}
        }
    }
}
