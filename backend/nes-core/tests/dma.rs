//! DMC sample-fetch DMA handshake (`ApuState::dmc_load_sample_buffer`),
//! exercised through the public register write + sample-load surface.

use nes_core::accumulator::DeltaAccumulator;
use nes_core::apu::ApuState;
use nes_core::config::{NesCoreConfig, TimingMode};
use nes_core::cpu::CpuState;

fn harness() -> (ApuState, CpuState, DeltaAccumulator, NesCoreConfig) {
    (ApuState::new(TimingMode::Ntsc), CpuState::new(12), DeltaAccumulator::new(1_789_773, 48_000), NesCoreConfig::default())
}

/// `addr=$C000`, `len=$11` (273 bytes), looping enabled: after exactly 273
/// sample loads the sample fetch must wrap back to the starting address
/// and reload `bytes_remaining` to its starting value instead of stalling
/// silent at zero.
#[test]
fn looping_dmc_sample_wraps_after_273_bytes_and_restarts_at_the_configured_address() {
    let (mut apu, mut cpu, mut acc, config) = harness();

    apu.write(0x4010, 0x40, 0, &mut cpu, &mut acc, &config); // loop flag set, IRQ disabled
    apu.write(0x4012, 0x00, 0, &mut cpu, &mut acc, &config); // sample address -> 0xC000
    apu.write(0x4013, 0x11, 0, &mut cpu, &mut acc, &config); // sample length -> 273
    apu.write(0x4015, 0x10, 0, &mut cpu, &mut acc, &config); // enable DMC

    assert_eq!(apu.dmc.length, 273);
    assert_eq!(apu.dmc.bytes_remaining, 273);
    assert_eq!(apu.dmc.addr_current, 0xC000);

    for i in 1..273u32 {
        apu.dmc_load_sample_buffer(0xAA, &mut cpu);
        assert_eq!(apu.dmc.bytes_remaining, 273 - i);
        assert_eq!(apu.dmc.addr_current, 0xC000u16.wrapping_add(i as u16));
    }

    // The 273rd load drains the counter to zero and, because looping is
    // enabled, immediately reloads it instead of raising the DMC IRQ.
    apu.dmc_load_sample_buffer(0xAA, &mut cpu);
    assert_eq!(apu.dmc.bytes_remaining, 273);
    assert_eq!(apu.dmc.addr_current, 0xC000);
    assert!(!cpu.interrupt_lines_due());
}

/// The same 273-byte sample with looping disabled instead raises the DMC
/// IRQ exactly once the counter drains, and does not restart the fetch.
#[test]
fn non_looping_dmc_sample_raises_the_irq_once_exhausted_and_does_not_restart() {
    let (mut apu, mut cpu, mut acc, config) = harness();

    apu.write(0x4010, 0x80, 0, &mut cpu, &mut acc, &config); // loop flag clear, IRQ enabled
    apu.write(0x4012, 0x00, 0, &mut cpu, &mut acc, &config);
    apu.write(0x4013, 0x11, 0, &mut cpu, &mut acc, &config);
    apu.write(0x4015, 0x10, 0, &mut cpu, &mut acc, &config);

    for _ in 0..273 {
        apu.dmc_load_sample_buffer(0xAA, &mut cpu);
    }

    assert_eq!(apu.dmc.bytes_remaining, 0);
    assert_eq!(apu.dmc.addr_current, 0xC000u16.wrapping_add(273), "a non-looping sample must not restart its address");
    assert!(cpu.interrupt_lines_due(), "exhausting a non-looping sample with IRQ enabled must raise the DMC IRQ");
}
