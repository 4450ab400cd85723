//! Error types surfaced by the core. Bus accesses and mid-frame component
//! interactions never fail (open-bus reads, dropped ROM writes); only
//! initialization and save-state loading can produce a hard error.

use thiserror::Error;

/// Returned from core construction.
#[derive(Debug, Error)]
pub enum CoreInitError {
    #[error("unsupported sample rate {rate} Hz (expected 8000-192000)")]
    UnsupportedSampleRate { rate: u32 },
    #[error("FDS BIOS image missing or wrong size: expected {expected} bytes, got {actual}")]
    InvalidFdsBios { expected: usize, actual: usize },
}

/// Returned from `save_state::load`. Loading is atomic: on error the core's
/// prior state is left untouched because the loader decodes into a scratch
/// value before swapping it in.
#[derive(Debug, Error)]
pub enum StateLoadError {
    #[error("unknown save state chunk tag {0:?}")]
    UnknownTag([u8; 4]),
    #[error("save state chunk {tag:?} has length {actual}, expected {expected}")]
    LengthMismatch { tag: [u8; 4], expected: usize, actual: usize },
    #[error("save state chunk {0:?} is truncated")]
    Truncated([u8; 4]),
    #[error("failed to decode save state chunk {tag:?}: {source}")]
    Decode { tag: [u8; 4], #[source] source: bincode::error::DecodeError },
    #[error("save state chunk {tag:?} does not match this core's configured expansion board")]
    ExpansionMismatch { tag: [u8; 4] },
}
