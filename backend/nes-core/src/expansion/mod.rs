//! Expansion audio dispatch: a single tagged enum over the six boards this
//! crate supports, following the same `Component`-tagged-dispatch design as
//! the rest of the bus (§9) rather than a trait object. The host builds the
//! variant that matches the loaded cartridge's mapper and hands it to
//! `NesCore::new`; selecting a mapper/board from a ROM image is outside
//! this crate's scope.

mod fds;
mod mmc5;
mod namco163;
mod sunsoft5b;
mod vrc6;
mod vrc7;

pub use fds::{FdsAudio, FDS_BIOS_SIZE};
pub use mmc5::Mmc5Audio;
pub use namco163::Namco163Audio;
pub use sunsoft5b::Sunsoft5bAudio;
pub use vrc6::Vrc6Audio;
pub use vrc7::Vrc7Audio;

use bincode::{Decode, Encode};

use crate::accumulator::DeltaAccumulator;
use crate::config::NesCoreConfig;
use crate::cpu::{CpuState, HandlerTable};

#[derive(Debug, Clone, Encode, Decode)]
pub enum ExpansionAudio {
    None,
    Vrc6(Vrc6Audio),
    Vrc7(Vrc7Audio),
    Fds(FdsAudio),
    Mmc5(Mmc5Audio),
    Namco163(Namco163Audio),
    Sunsoft5b(Sunsoft5bAudio),
}

impl ExpansionAudio {
    pub fn install_handlers(&self, handlers: &mut HandlerTable) {
        match self {
            Self::None => {}
            Self::Vrc6(c) => c.install_handlers(handlers),
            Self::Vrc7(c) => c.install_handlers(handlers),
            Self::Fds(c) => c.install_handlers(handlers),
            Self::Mmc5(c) => c.install_handlers(handlers),
            Self::Namco163(c) => c.install_handlers(handlers),
            Self::Sunsoft5b(c) => c.install_handlers(handlers),
        }
    }

    pub fn reset(&mut self, hard: bool) {
        match self {
            Self::None => {}
            Self::Vrc6(c) => c.reset(hard),
            Self::Vrc7(c) => c.reset(hard),
            Self::Fds(c) => c.reset(hard),
            Self::Mmc5(c) => c.reset(hard),
            Self::Namco163(c) => c.reset(hard),
            Self::Sunsoft5b(c) => c.reset(hard),
        }
    }

    pub fn end_frame(&mut self, cycles: u32) {
        match self {
            Self::None => {}
            Self::Vrc6(c) => c.end_frame(cycles),
            Self::Vrc7(c) => c.end_frame(cycles),
            Self::Fds(c) => c.end_frame(cycles),
            Self::Mmc5(c) => c.end_frame(cycles),
            Self::Namco163(c) => c.end_frame(cycles),
            Self::Sunsoft5b(c) => c.end_frame(cycles),
        }
    }

    pub fn run(&mut self, cycles: u32, acc: &mut DeltaAccumulator, config: &NesCoreConfig) {
        match self {
            Self::None => {}
            Self::Vrc6(c) => c.run(cycles, acc, config),
            Self::Vrc7(c) => c.run(cycles, acc, config),
            Self::Fds(c) => c.run(cycles, acc, config),
            Self::Mmc5(c) => c.run(cycles, acc, config),
            Self::Namco163(c) => c.run(cycles, acc, config),
            Self::Sunsoft5b(c) => c.run(cycles, acc, config),
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
        match self {
            Self::None => bus_value,
            Self::Vrc6(c) => c.read(addr, bus_value),
            Self::Vrc7(c) => c.read(addr, bus_value),
            Self::Fds(c) => c.read(addr, cycle, acc, config, bus_value),
            Self::Mmc5(c) => c.read(addr, cycle, bus_value, acc, config, cpu),
            Self::Namco163(c) => c.read(addr, cycle, bus_value, acc, config),
            Self::Sunsoft5b(c) => c.read(addr, bus_value),
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
        match self {
            Self::None => {}
            Self::Vrc6(c) => c.write(addr, value, cycle, acc, config),
            Self::Vrc7(c) => c.write(addr, value, cycle, acc, config),
            Self::Fds(c) => c.write(addr, value, cycle, acc, config),
            Self::Mmc5(c) => c.write(addr, value, cycle, acc, config, cpu),
            Self::Namco163(c) => c.write(addr, value, cycle, acc, config),
            Self::Sunsoft5b(c) => c.write(addr, value, cycle, acc, config),
        }
    }
}
