//! orus-bytecode — the in-memory bytecode buffer Orus compiles into.
//!
//! [`BytecodeBuffer`] (C3) is an append-only code stream with a parallel
//! line/column map, a constant pool, and a jump-patch registry. It never
//! touches disk: a compiled [`Chunk`]/[`Function`] lives only as long as the
//! [`orus_vm`] instance (a separate crate) that runs it.
//!
//! Features:
//! - `std` (default): `thiserror`-based `Display`/`Error` on [`ChunkError`].
//! - `serde`: derive (de)serialization on [`Opcode`].

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

mod buffer;
mod chunk;
mod error;
mod opcode;

pub use buffer::{BytecodeBuffer, JumpPatch};
pub use chunk::{Chunk, Function};
pub use error::{ChunkError, ChunkResult};
pub use opcode::{JumpWidth, Opcode};
