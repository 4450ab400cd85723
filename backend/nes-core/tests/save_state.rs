//! Save/load round trips exercised against a full `NesCore`, using only
//! the public `save_state::{save, load}` surface plus construction.

use nes_core::config::{NesCoreConfig, TimingMode};
use nes_core::expansion::{ExpansionAudio, Vrc6Audio};
use nes_core::save_state;
use nes_core::NesCore;

fn core(expansion: ExpansionAudio) -> NesCore {
    NesCore::new(TimingMode::Ntsc, expansion, NesCoreConfig::default(), None).unwrap()
}

#[test]
fn a_full_frame_of_activity_survives_a_save_and_load_round_trip() {
    let mut source = core(ExpansionAudio::Vrc6(Vrc6Audio::new(12, false)));
    source.cpu.regs.a = 0x7E;
    source.cpu.regs.pc = 0x8123;
    source.apu.write(0x4015, 0x0F, 0, &mut source.cpu, &mut source.accumulator, &source.config);
    source.apu.write(0x4000, 0b1011_1111, 0, &mut source.cpu, &mut source.accumulator, &source.config);

    let mut audio_out = [0i16; 4096];
    source.run_frame(29_780, &mut audio_out);

    let chunks = save_state::save(&source);

    let mut target = core(ExpansionAudio::Vrc6(Vrc6Audio::new(12, false)));
    save_state::load(&mut target, &chunks).unwrap();

    assert_eq!(target.cpu.regs.a, source.cpu.regs.a);
    assert_eq!(target.cpu.regs.pc, source.cpu.regs.pc);
    assert_eq!(target.apu.pulse[0].duty_cycle, source.apu.pulse[0].duty_cycle);
    assert_eq!(target.cpu.cycles, source.cpu.cycles);
}

#[test]
fn loading_an_expansion_chunk_for_the_wrong_board_leaves_the_core_untouched() {
    let donor = core(ExpansionAudio::Vrc6(Vrc6Audio::new(12, false)));
    let chunks = save_state::save(&donor);

    let mut target = core(ExpansionAudio::None);
    target.cpu.regs.a = 0x55;

    let result = save_state::load(&mut target, &chunks);

    assert!(result.is_err());
    assert_eq!(target.cpu.regs.a, 0x55, "a batch that fails must not partially apply");
}
