//! Base APU channel scheduling exercised end to end through `ApuState`'s
//! public register and run-to-cycle surface (`write`/`run`), without
//! reaching into the scheduler's private fields.

use nes_core::accumulator::DeltaAccumulator;
use nes_core::apu::ApuState;
use nes_core::config::{NesCoreConfig, TimingMode};
use nes_core::cpu::CpuState;

fn harness() -> (ApuState, CpuState, DeltaAccumulator, NesCoreConfig) {
    (ApuState::new(TimingMode::Ntsc), CpuState::new(12), DeltaAccumulator::new(1_789_773, 48_000), NesCoreConfig::default())
}

/// A 50%-duty pulse at period 0x1FE steps through its full 8-phase cycle
/// in exactly 8 timer reloads and ends up back where it started, with the
/// two amplitude flips it makes along the way cancelling out.
#[test]
fn pulse_full_duty_cycle_makes_exactly_eight_phase_transitions_with_a_net_zero_amplitude_swing() {
    let (mut apu, mut cpu, mut acc, config) = harness();

    apu.write(0x4015, 0x01, 0, &mut cpu, &mut acc, &config);
    apu.write(0x4000, 0b0111_1111, 0, &mut cpu, &mut acc, &config); // duty 50%, constant volume 15
    apu.write(0x4001, 0x00, 0, &mut cpu, &mut acc, &config); // sweep disabled
    apu.write(0x4002, 0xFE, 0, &mut cpu, &mut acc, &config); // period low byte -> 0x1FE
    apu.write(0x4003, 0x01, 0, &mut cpu, &mut acc, &config); // period high bits, reloads length

    let starting_phase = apu.pulse[0].phase;
    let starting_amplitude = apu.pulse[0].amplitude;

    let timer_period = i64::from((0x1FE << 1) + 2);
    let step = (timer_period * 12) as u32;

    let mut transitions = 0;
    let mut net_amplitude_delta: i32 = 0;
    let mut last_phase = starting_phase;
    let mut last_amplitude = starting_amplitude;

    for i in 1..=8u32 {
        apu.run(step * i, &mut acc, &config, &mut cpu);

        assert_ne!(apu.pulse[0].phase, last_phase, "step {i} must advance the duty phase");
        transitions += 1;
        net_amplitude_delta += apu.pulse[0].amplitude - last_amplitude;

        last_phase = apu.pulse[0].phase;
        last_amplitude = apu.pulse[0].amplitude;
    }

    assert_eq!(transitions, 8);
    assert_eq!(apu.pulse[0].phase, starting_phase, "phase must return to its starting point after one full period");
    assert_eq!(apu.pulse[0].amplitude, starting_amplitude);
    assert_eq!(net_amplitude_delta, 0, "the rising and falling duty edges must cancel over one full period");
}

/// A pulse timer period below 8 is the documented ultrasonic mute: the
/// phase generator must never advance regardless of how long it runs.
#[test]
fn pulse_below_minimum_period_never_advances_its_phase() {
    let (mut apu, mut cpu, mut acc, config) = harness();

    apu.write(0x4015, 0x01, 0, &mut cpu, &mut acc, &config);
    apu.write(0x4000, 0b0011_1111, 0, &mut cpu, &mut acc, &config); // constant volume 15
    apu.write(0x4002, 0x02, 0, &mut cpu, &mut acc, &config); // period low -> 2 (below the 8 floor)
    apu.write(0x4003, 0x00, 0, &mut cpu, &mut acc, &config);

    apu.run(200_000, &mut acc, &config, &mut cpu);

    assert_eq!(apu.pulse[0].amplitude, 0);
}

/// Writing the length counter for a disabled channel leaves its counter
/// at zero, which in turn silences the channel regardless of envelope
/// settings (channel_volume reads zero length as volume zero).
#[test]
fn disabling_a_channel_through_the_status_register_clears_its_length_counter() {
    let (mut apu, mut cpu, mut acc, config) = harness();

    apu.write(0x4015, 0x01, 0, &mut cpu, &mut acc, &config);
    apu.write(0x4003, 0x08, 0, &mut cpu, &mut acc, &config); // reload length counter
    assert!(apu.pulse[0].length.counter > 0);

    apu.write(0x4015, 0x00, 0, &mut cpu, &mut acc, &config);
    assert_eq!(apu.pulse[0].length.counter, 0);
}
