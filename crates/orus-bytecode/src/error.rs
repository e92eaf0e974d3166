//! Errors raised while building or patching a [`crate::BytecodeBuffer`].

use core::fmt;

#[cfg(feature = "std")]
use thiserror::Error;

/// Failure modes for buffer construction, jump patching, and opcode decoding.
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    /// A byte didn't decode to a known [`crate::Opcode`].
    #[cfg_attr(feature = "std", error("invalid opcode byte 0x{0:02X}"))]
    InvalidOpcode(u8),
    /// `allocate_jump_placeholder` was called with an opcode that doesn't
    /// reserve an offset field.
    #[cfg_attr(feature = "std", error("opcode {0:?} is not a jump/branch opcode"))]
    NotAJumpOpcode(crate::Opcode),
    /// `patch_jump` was given a patch index past the end of the registry.
    #[cfg_attr(feature = "std", error("jump patch index {0} out of range"))]
    PatchIndexOutOfRange(usize),
    /// The computed relative offset doesn't fit the opcode's reserved width.
    #[cfg_attr(
        feature = "std",
        error("jump offset {offset} does not fit the reserved {width}-bit field")
    )]
    OffsetOutOfRange {
        /// The signed byte offset that was computed.
        offset: i64,
        /// The reserved field width, in bits (8 or 16).
        width: u8,
    },
}

#[cfg(not(feature = "std"))]
impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::InvalidOpcode(b) => write!(f, "invalid opcode byte 0x{b:02X}"),
            ChunkError::NotAJumpOpcode(op) => write!(f, "opcode {op:?} is not a jump/branch opcode"),
            ChunkError::PatchIndexOutOfRange(i) => write!(f, "jump patch index {i} out of range"),
            ChunkError::OffsetOutOfRange { offset, width } => {
                write!(f, "jump offset {offset} does not fit the reserved {width}-bit field")
            }
        }
    }
}

/// Result alias for this crate's fallible operations.
pub type ChunkResult<T> = core::result::Result<T, ChunkError>;
