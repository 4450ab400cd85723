//! NES/Famicom emulation core: cycle-accurate 6502 CPU, base APU, and the
//! six expansion audio boards, all driven by a single run-to-cycle
//! scheduler. PPU pixel rendering, the input/GUI frontend, save-state file
//! packaging, the general mapper catalogue, and ROM parsing are out of
//! scope; a host combines this crate with its own PPU and cartridge/mapper
//! implementation by installing pagetable entries and handler-table
//! entries on [`cpu::CpuState`] directly.

pub mod accumulator;
pub mod apu;
pub mod config;
pub mod cpu;
pub mod error;
pub mod expansion;
pub mod rate_control;
pub mod save_state;

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::apu::ApuState;
use crate::config::{NesCoreConfig, TimingMode};
use crate::cpu::{Component, CpuState, PAGE_SIZE};
use crate::error::CoreInitError;
use crate::expansion::ExpansionAudio;
use crate::rate_control::{RateControlConfig, RateController};

const INTERNAL_RAM_PAGES: usize = 2;

/// The single owning struct for an emulated console (§9's arena design).
/// Every subsystem is held by value; cross-subsystem access goes through
/// `&mut self` field destructuring rather than shared pointers, so there
/// is never an aliasing question to answer.
#[derive(Debug, Clone, Encode, Decode)]
pub struct NesCore {
    pub cpu: CpuState,
    pub apu: ApuState,
    pub expansion: ExpansionAudio,
    pub accumulator: DeltaAccumulator,
    pub rate_controller: RateController,
    pub config: NesCoreConfig,
    timing_mode: TimingMode,

    /// Flat arena backing every pagetable `bank` index. Only the two
    /// physical 1 KiB halves of internal RAM are populated by this crate;
    /// cartridge PRG RAM/ROM banks are the host's responsibility to append
    /// and wire up via [`cpu::CpuState::set_pagetable_entry`].
    page_banks: Vec<[u8; PAGE_SIZE]>,
}

impl NesCore {
    /// Builds a fresh core for the given timing mode and expansion board.
    /// `sample_rate` must be nonzero or every downstream rate computation
    /// (accumulator, rate controller) divides by zero. `fds_bios` is only
    /// consulted when `expansion` is [`ExpansionAudio::Fds`]; this crate
    /// does not map the image into the address space itself (that is the
    /// host's job, the same as any other ROM bank via
    /// [`cpu::CpuState::set_pagetable_entry`]) but it does refuse to build
    /// a core around a disk system whose BIOS is missing or the wrong size.
    pub fn new(
        timing_mode: TimingMode,
        expansion: ExpansionAudio,
        config: NesCoreConfig,
        fds_bios: Option<&[u8]>,
    ) -> Result<Self, CoreInitError> {
        if config.sample_rate == 0 {
            return Err(CoreInitError::UnsupportedSampleRate { rate: config.sample_rate });
        }

        if matches!(expansion, ExpansionAudio::Fds(_)) {
            let actual = fds_bios.map_or(0, <[u8]>::len);
            if actual != expansion::FDS_BIOS_SIZE {
                return Err(CoreInitError::InvalidFdsBios { expected: expansion::FDS_BIOS_SIZE, actual });
            }
        }

        let clock_divider = timing_mode.cpu_clock_divider();
        let mut cpu = CpuState::new(clock_divider);

        // (Somewhat) randomize initial RAM contents
        let page_banks: Vec<[u8; PAGE_SIZE]> = (0..INTERNAL_RAM_PAGES)
            .map(|_| std::array::from_fn(|_| if rand::random() { 0x00 } else { 0xFF }))
            .collect();
        for page in 0..8 {
            let bank = (page % INTERNAL_RAM_PAGES) as u16;
            cpu.set_pagetable_entry(page, true, true, Some(bank));
        }

        cpu.handlers.set_write(0x4014, 1, 0, Component::OamDma);
        apu::install_handlers(&mut cpu.handlers);
        expansion.install_handlers(&mut cpu.handlers);

        let master_clock_rate = master_clock_hz(timing_mode);
        let accumulator = DeltaAccumulator::new(master_clock_rate, config.sample_rate);
        let rate_controller = RateController::new(RateControlConfig {
            base_sample_rate: config.sample_rate,
            low_watermark_frames: config.low_watermark_frames,
            buffer_range_frames: config.buffer_range_frames,
            max_adjust: config.rate_adjust_max,
            frames_per_second: frame_rate_hz(timing_mode),
        });

        Ok(Self {
            cpu,
            apu: ApuState::new(timing_mode),
            expansion,
            accumulator,
            rate_controller,
            config,
            timing_mode,
            page_banks,
        })
    }

    #[must_use]
    pub fn timing_mode(&self) -> TimingMode {
        self.timing_mode
    }

    /// Resets every subsystem. A hard reset also zeroes RAM; a soft reset
    /// (reset button / `RESET` line) leaves RAM intact (§5).
    pub fn reset(&mut self, hard: bool) {
        self.cpu.reset(hard);
        if hard {
            for bank in &mut self.page_banks {
                bank.fill(0);
            }
        }
        self.apu.reset(hard);
        self.expansion.reset(hard);
    }

    /// Runs the CPU (and, transitively, every subsystem it catches up)
    /// for one frame's worth of master clock cycles, then drains the
    /// accumulator into `audio_out`. Returns the number of audio frames
    /// written.
    pub fn run_frame(&mut self, frame_cycles: u32, audio_out: &mut [i16]) -> usize {
        self.cpu.update_interrupt_mask();
        self.run_cpu(frame_cycles);

        self.apu.run(frame_cycles, &mut self.accumulator, &self.config, &mut self.cpu);
        self.expansion.run(frame_cycles, &mut self.accumulator, &self.config);

        self.accumulator.end_frame(frame_cycles);
        self.cpu.end_frame(frame_cycles);
        self.apu.end_frame(frame_cycles);
        self.expansion.end_frame(frame_cycles);

        if self.config.dynamic_rate_control {
            self.rate_controller.update(self.accumulator.samples_available());
            self.accumulator
                .set_rates(master_clock_hz(self.timing_mode), self.rate_controller.effective_sample_rate());
        }

        let stereo = matches!(self.config.channels, config::AudioChannels::Stereo);
        self.accumulator.read_samples(audio_out, stereo)
    }

    fn read_page_bank(&self, bank: u16, addr: u16) -> u8 {
        self.page_banks[bank as usize][(addr as usize) & (PAGE_SIZE - 1)]
    }

    fn write_page_bank(&mut self, bank: u16, addr: u16, value: u8) {
        self.page_banks[bank as usize][(addr as usize) & (PAGE_SIZE - 1)] = value;
    }

    fn apu_dmc_load_buf(&mut self, byte: u8) {
        self.apu.dmc_load_sample_buffer(byte, &mut self.cpu);
    }

    fn dispatch_read(&mut self, component: Component, addr: u16, bus_value: u8) -> u8 {
        let cycle = self.cpu.cycles;
        match component {
            Component::ApuPulse0
            | Component::ApuPulse1
            | Component::ApuTriangle
            | Component::ApuNoise
            | Component::ApuDmc
            | Component::ApuStatus
            | Component::ApuFrameCounter => {
                self.apu.read(addr, cycle, &mut self.cpu, &mut self.accumulator, &self.config, bus_value)
            }
            Component::Vrc6 | Component::Vrc7 | Component::Fds | Component::Mmc5 | Component::Namco163 | Component::Sunsoft5b => {
                self.expansion.read(addr, cycle, bus_value, &mut self.accumulator, &self.config, &mut self.cpu)
            }
            Component::InternalRam | Component::OamDma | Component::PpuRegisters | Component::External => bus_value,
        }
    }

    fn dispatch_write(&mut self, component: Component, addr: u16, value: u8) {
        let cycle = self.cpu.cycles;
        match component {
            Component::ApuPulse0
            | Component::ApuPulse1
            | Component::ApuTriangle
            | Component::ApuNoise
            | Component::ApuDmc
            | Component::ApuStatus
            | Component::ApuFrameCounter => {
                self.apu.write(addr, value, cycle, &mut self.cpu, &mut self.accumulator, &self.config)
            }
            Component::Vrc6 | Component::Vrc7 | Component::Fds | Component::Mmc5 | Component::Namco163 | Component::Sunsoft5b => {
                self.expansion.write(addr, value, cycle, &mut self.accumulator, &self.config, &mut self.cpu)
            }
            Component::OamDma => {
                let odd_cycle = self.cpu.cycles % (2 * self.cpu.clock_divider) != 0;
                self.cpu.oam_dma(value, odd_cycle);
            }
            Component::InternalRam | Component::PpuRegisters | Component::External => {
                log::trace!("write to unbacked/host-owned address {addr:#06x} dropped");
            }
        }
    }
}

#[must_use]
pub fn master_clock_hz(mode: TimingMode) -> u32 {
    match mode {
        TimingMode::Ntsc => 21_477_272,
        TimingMode::Pal => 26_601_712,
        TimingMode::Dendy => 26_601_712,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expansion::{FdsAudio, FDS_BIOS_SIZE};

    #[test]
    fn constructing_an_fds_core_without_a_bios_image_is_refused() {
        let expansion = ExpansionAudio::Fds(FdsAudio::new(12));
        let result = NesCore::new(TimingMode::Ntsc, expansion, NesCoreConfig::default(), None);
        assert!(matches!(
            result,
            Err(CoreInitError::InvalidFdsBios { expected: FDS_BIOS_SIZE, actual: 0 })
        ));
    }

    #[test]
    fn constructing_an_fds_core_with_a_wrong_sized_bios_image_is_refused() {
        let expansion = ExpansionAudio::Fds(FdsAudio::new(12));
        let short_bios = vec![0u8; FDS_BIOS_SIZE - 1];
        let result = NesCore::new(TimingMode::Ntsc, expansion, NesCoreConfig::default(), Some(&short_bios));
        assert!(matches!(
            result,
            Err(CoreInitError::InvalidFdsBios { expected: FDS_BIOS_SIZE, actual }) if actual == FDS_BIOS_SIZE - 1
        ));
    }

    #[test]
    fn constructing_an_fds_core_with_a_correctly_sized_bios_image_succeeds() {
        let expansion = ExpansionAudio::Fds(FdsAudio::new(12));
        let bios = vec![0u8; FDS_BIOS_SIZE];
        let result = NesCore::new(TimingMode::Ntsc, expansion, NesCoreConfig::default(), Some(&bios));
        assert!(result.is_ok());
    }

    #[test]
    fn a_non_fds_core_ignores_the_bios_argument_entirely() {
        let result = NesCore::new(TimingMode::Ntsc, ExpansionAudio::None, NesCoreConfig::default(), None);
        assert!(result.is_ok());
    }
}

#[must_use]
pub fn frame_rate_hz(mode: TimingMode) -> f64 {
    match mode {
        TimingMode::Ntsc => 60.098_8,
        TimingMode::Pal => 50.006_98,
        TimingMode::Dendy => 50.006_98,
    }
}
