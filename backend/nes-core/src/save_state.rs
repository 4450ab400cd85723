//! Save-state chunk framing (§6.3): every subsystem packs into an opaque,
//! tag-identified byte block. Grounded on cxnes's `pack_state`/`unpack_state`/
//! `save_state_add_chunk`/`save_state_find_chunk`, which establish the
//! `(tag, payload)` chunk shape and that a declared chunk's length must
//! match what its fields decode to. This crate stops at the in-memory
//! `Vec<(Tag, Vec<u8>)>` shape; packaging that into a file is a host concern.
//!
//! Loading is atomic across the whole batch: every chunk is decoded into a
//! scratch value first, and the core is only mutated once every chunk in
//! the batch has decoded successfully.

use bincode::{Decode, Encode};

use crate::apu::ApuState;
use crate::cpu::CpuState;
use crate::error::StateLoadError;
use crate::expansion::ExpansionAudio;
use crate::NesCore;

pub type Tag = [u8; 4];

const TAG_CPU: Tag = *b"CPU ";
const TAG_APU: Tag = *b"APU ";
const TAG_VRC6: Tag = *b"VC6S";
const TAG_VRC7: Tag = *b"VC7S";
const TAG_FDS: Tag = *b"FDSS";
const TAG_MMC5: Tag = *b"MC5S";
const TAG_NAMCO163: Tag = *b"N163";
const TAG_SUNSOFT5B: Tag = *b"S5BS";

macro_rules! bincode_config {
    () => {
        bincode::config::standard().with_little_endian()
    };
}

fn encode_chunk<T: Encode>(tag: Tag, value: &T) -> (Tag, Vec<u8>) {
    let payload = bincode::encode_to_vec(value, bincode_config!())
        .expect("in-memory encode of a fixed value graph cannot fail");
    (tag, payload)
}

fn decode_chunk<T: Decode<()>>(tag: Tag, payload: &[u8]) -> Result<T, StateLoadError> {
    match bincode::decode_from_slice::<T, _>(payload, bincode_config!()) {
        Ok((value, consumed)) if consumed == payload.len() => Ok(value),
        Ok((_, consumed)) => {
            Err(StateLoadError::LengthMismatch { tag, expected: consumed, actual: payload.len() })
        }
        Err(bincode::error::DecodeError::UnexpectedEnd { .. }) => Err(StateLoadError::Truncated(tag)),
        Err(source) => Err(StateLoadError::Decode { tag, source }),
    }
}

/// Packs every live subsystem into its own tagged chunk. Only the chunk for
/// the core's currently configured expansion board is produced; a core
/// built with [`ExpansionAudio::None`] emits no expansion chunk at all.
#[must_use]
pub fn save(core: &NesCore) -> Vec<(Tag, Vec<u8>)> {
    let mut chunks = vec![encode_chunk(TAG_CPU, &core.cpu), encode_chunk(TAG_APU, &core.apu)];

    match &core.expansion {
        ExpansionAudio::None => {}
        ExpansionAudio::Vrc6(chip) => chunks.push(encode_chunk(TAG_VRC6, chip)),
        ExpansionAudio::Vrc7(chip) => chunks.push(encode_chunk(TAG_VRC7, chip)),
        ExpansionAudio::Fds(chip) => chunks.push(encode_chunk(TAG_FDS, chip)),
        ExpansionAudio::Mmc5(chip) => chunks.push(encode_chunk(TAG_MMC5, chip)),
        ExpansionAudio::Namco163(chip) => chunks.push(encode_chunk(TAG_NAMCO163, chip)),
        ExpansionAudio::Sunsoft5b(chip) => chunks.push(encode_chunk(TAG_SUNSOFT5B, chip)),
    }

    chunks
}

/// Restores `core` from a chunk batch previously produced by [`save`].
/// An unknown tag, a truncated payload, or an expansion chunk that doesn't
/// match `core`'s configured board is refused without touching `core`.
pub fn load(core: &mut NesCore, chunks: &[(Tag, Vec<u8>)]) -> Result<(), StateLoadError> {
    let mut new_cpu = None;
    let mut new_apu = None;
    let mut new_expansion = None;

    for (tag, payload) in chunks {
        match *tag {
            TAG_CPU => new_cpu = Some(decode_chunk::<CpuState>(*tag, payload)?),
            TAG_APU => new_apu = Some(decode_chunk::<ApuState>(*tag, payload)?),
            TAG_VRC6 => {
                if !matches!(core.expansion, ExpansionAudio::Vrc6(_)) {
                    return Err(StateLoadError::ExpansionMismatch { tag: *tag });
                }
                new_expansion = Some(ExpansionAudio::Vrc6(decode_chunk(*tag, payload)?));
            }
            TAG_VRC7 => {
                if !matches!(core.expansion, ExpansionAudio::Vrc7(_)) {
                    return Err(StateLoadError::ExpansionMismatch { tag: *tag });
                }
                new_expansion = Some(ExpansionAudio::Vrc7(decode_chunk(*tag, payload)?));
            }
            TAG_FDS => {
                if !matches!(core.expansion, ExpansionAudio::Fds(_)) {
                    return Err(StateLoadError::ExpansionMismatch { tag: *tag });
                }
                new_expansion = Some(ExpansionAudio::Fds(decode_chunk(*tag, payload)?));
            }
            TAG_MMC5 => {
                if !matches!(core.expansion, ExpansionAudio::Mmc5(_)) {
                    return Err(StateLoadError::ExpansionMismatch { tag: *tag });
                }
                new_expansion = Some(ExpansionAudio::Mmc5(decode_chunk(*tag, payload)?));
            }
            TAG_NAMCO163 => {
                if !matches!(core.expansion, ExpansionAudio::Namco163(_)) {
                    return Err(StateLoadError::ExpansionMismatch { tag: *tag });
                }
                new_expansion = Some(ExpansionAudio::Namco163(decode_chunk(*tag, payload)?));
            }
            TAG_SUNSOFT5B => {
                if !matches!(core.expansion, ExpansionAudio::Sunsoft5b(_)) {
                    return Err(StateLoadError::ExpansionMismatch { tag: *tag });
                }
                new_expansion = Some(ExpansionAudio::Sunsoft5b(decode_chunk(*tag, payload)?));
            }
            other => return Err(StateLoadError::UnknownTag(other)),
        }
    }

    if let Some(cpu) = new_cpu {
        core.cpu = cpu;
    }
    if let Some(apu) = new_apu {
        core.apu = apu;
    }
    if let Some(expansion) = new_expansion {
        core.expansion = expansion;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NesCoreConfig, TimingMode};

    fn core_with(expansion: ExpansionAudio) -> NesCore {
        NesCore::new(TimingMode::Ntsc, expansion, NesCoreConfig::default(), None).unwrap()
    }

    #[test]
    fn save_then_load_restores_cpu_and_apu_state() {
        let mut core = core_with(ExpansionAudio::None);
        core.cpu.regs.a = 0x42;
        core.cpu.regs.pc = 0xabcd;
        core.apu.write(0x4015, 0x0f, 0, &mut core.cpu, &mut core.accumulator, &core.config);

        let chunks = save(&core);
        assert_eq!(chunks.len(), 2, "a None-expansion core emits only the CPU and APU chunks");

        let mut restored = core_with(ExpansionAudio::None);
        load(&mut restored, &chunks).unwrap();

        assert_eq!(restored.cpu.regs.a, 0x42);
        assert_eq!(restored.cpu.regs.pc, 0xabcd);
    }

    #[test]
    fn save_includes_the_configured_expansion_chunk() {
        let core = core_with(ExpansionAudio::Vrc6(crate::expansion::Vrc6Audio::new(12, false)));
        let chunks = save(&core);
        assert!(chunks.iter().any(|(tag, _)| *tag == TAG_VRC6));
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn load_rejects_an_expansion_chunk_that_does_not_match_the_core() {
        let donor = core_with(ExpansionAudio::Vrc6(crate::expansion::Vrc6Audio::new(12, false)));
        let chunks = save(&donor);

        let mut target = core_with(ExpansionAudio::Sunsoft5b(crate::expansion::Sunsoft5bAudio::new(12)));
        let result = load(&mut target, &chunks);
        assert!(matches!(result, Err(StateLoadError::ExpansionMismatch { tag: TAG_VRC6 })));
    }

    #[test]
    fn load_rejects_an_unknown_tag_without_mutating_the_core() {
        let mut core = core_with(ExpansionAudio::None);
        core.cpu.regs.a = 0x99;

        let bogus = vec![(*b"XXXX", vec![1, 2, 3])];
        let result = load(&mut core, &bogus);

        assert!(matches!(result, Err(StateLoadError::UnknownTag(tag)) if tag == *b"XXXX"));
        assert_eq!(core.cpu.regs.a, 0x99, "a rejected batch must leave the core untouched");
    }
}
