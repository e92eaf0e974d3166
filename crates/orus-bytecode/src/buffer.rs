//! The append-only bytecode buffer: code stream, line/column maps, constant
//! pool, and jump-patch registry.

#[cfg(feature = "std")]
use std::vec::Vec;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use orus_core::Value;

use crate::error::{ChunkError, ChunkResult};
use crate::opcode::{JumpWidth, Opcode};

/// A reserved, not-yet-written jump/branch offset field.
#[derive(Clone, Debug)]
pub struct JumpPatch {
    /// Byte offset of the first byte of the reserved offset field.
    code_offset: usize,
    /// How many bytes the field occupies.
    width: JumpWidth,
    /// Set once `patch_jump` has written a value here.
    resolved: bool,
}

impl JumpPatch {
    /// Byte offset of the reserved field within the owning buffer's code stream.
    pub fn code_offset(&self) -> usize {
        self.code_offset
    }
    /// Whether `patch_jump` has resolved this entry.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }
}

/// Append-only code stream with a parallel line/column map, a constant pool,
/// and a jump-patch registry. `lines` and `columns` always have one entry per
/// byte in `code`.
#[derive(Clone, Debug, Default)]
pub struct BytecodeBuffer {
    code: Vec<u8>,
    lines: Vec<u32>,
    columns: Vec<u32>,
    constants: Vec<Value>,
    patches: Vec<JumpPatch>,
    current_line: u32,
    current_column: u32,
}

impl BytecodeBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes emitted so far.
    pub fn count(&self) -> usize {
        self.code.len()
    }

    /// Capacity of the underlying code vector.
    pub fn capacity(&self) -> usize {
        self.code.capacity()
    }

    /// Raw code bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Source line recorded for byte `offset`, if any.
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        self.lines.get(offset).copied()
    }

    /// Source column recorded for byte `offset`, if any.
    pub fn column_at(&self, offset: usize) -> Option<u32> {
        self.columns.get(offset).copied()
    }

    /// The constant pool.
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// The jump-patch registry, for analyzers that need to confirm every
    /// placeholder was resolved before `OP_HALT`.
    pub fn patches(&self) -> &[JumpPatch] {
        &self.patches
    }

    /// `true` once every allocated jump placeholder has been patched.
    pub fn all_patches_resolved(&self) -> bool {
        self.patches.iter().all(JumpPatch::is_resolved)
    }

    /// Sets the source location attributed to subsequently emitted bytes.
    /// The compiler calls this once per statement/expression before emitting
    /// the instructions that implement it.
    pub fn set_location(&mut self, line: u32, column: u32) {
        self.current_line = line;
        self.current_column = column;
    }

    fn push_byte(&mut self, byte: u8) -> usize {
        let offset = self.code.len();
        self.code.push(byte);
        self.lines.push(self.current_line);
        self.columns.push(self.current_column);
        offset
    }

    /// Appends a single byte, returning its offset.
    pub fn emit_byte(&mut self, byte: u8) -> usize {
        self.push_byte(byte)
    }

    /// Appends a little-endian `u16`, returning the offset of its first byte.
    pub fn emit_short(&mut self, value: u16) -> usize {
        let offset = self.push_byte((value & 0xFF) as u8);
        self.push_byte((value >> 8) as u8);
        offset
    }

    /// Appends a little-endian `i32`, returning the offset of its first byte.
    pub fn emit_i32(&mut self, value: i32) -> usize {
        let bytes = value.to_le_bytes();
        let offset = self.push_byte(bytes[0]);
        self.push_byte(bytes[1]);
        self.push_byte(bytes[2]);
        self.push_byte(bytes[3]);
        offset
    }

    /// Appends an opcode byte followed by `operands` verbatim. Does not cover
    /// jump/branch offset fields; use [`Self::allocate_jump_placeholder`] and
    /// [`Self::patch_jump`] for those. Returns the offset of the opcode byte.
    pub fn emit_instruction(&mut self, opcode: Opcode, operands: &[u8]) -> usize {
        let offset = self.push_byte(opcode as u8);
        for &b in operands {
            self.push_byte(b);
        }
        offset
    }

    /// Interns `value` into the constant pool and returns its index.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        let idx = self.constants.len() as u32;
        self.constants.push(value);
        idx
    }

    /// Reserves `opcode`'s offset field (already preceded by its opcode byte
    /// and any fixed operands, which the caller emits separately) and
    /// registers it in the patch table. Returns the patch's index into
    /// [`Self::patches`], the "opaque index" later passed to
    /// [`Self::patch_jump`].
    pub fn allocate_jump_placeholder(&mut self, opcode: Opcode) -> ChunkResult<usize> {
        let width = opcode.jump_width().ok_or(ChunkError::NotAJumpOpcode(opcode))?;
        let code_offset = self.code.len();
        for _ in 0..width.byte_len() {
            self.push_byte(0);
        }
        let index = self.patches.len();
        self.patches.push(JumpPatch { code_offset, width, resolved: false });
        Ok(index)
    }

    /// Writes `target_offset` into the reserved field at `patch_index`, as a
    /// signed offset measured from the byte immediately after the field.
    /// Fails if the offset doesn't fit the field's width.
    pub fn patch_jump(&mut self, patch_index: usize, target_offset: usize) -> ChunkResult<()> {
        let patch =
            self.patches.get_mut(patch_index).ok_or(ChunkError::PatchIndexOutOfRange(patch_index))?;
        let field_end = patch.code_offset + patch.width.byte_len();
        let relative = target_offset as i64 - field_end as i64;
        match patch.width {
            JumpWidth::Short => {
                let value = i8::try_from(relative)
                    .map_err(|_| ChunkError::OffsetOutOfRange { offset: relative, width: 8 })?;
                self.code[patch.code_offset] = value as u8;
            }
            JumpWidth::Wide => {
                let value = i16::try_from(relative)
                    .map_err(|_| ChunkError::OffsetOutOfRange { offset: relative, width: 16 })?;
                let bytes = value.to_le_bytes();
                self.code[patch.code_offset] = bytes[0];
                self.code[patch.code_offset + 1] = bytes[1];
            }
        }
        patch.resolved = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lines_and_columns_track_every_byte() {
        let mut buf = BytecodeBuffer::new();
        buf.set_location(3, 7);
        buf.emit_instruction(Opcode::MoveR, &[1, 2]);
        assert_eq!(buf.count(), 3);
        for off in 0..3 {
            assert_eq!(buf.line_at(off), Some(3));
            assert_eq!(buf.column_at(off), Some(7));
        }
    }

    #[test]
    fn forward_jump_patches_relative_to_byte_after_field() {
        let mut buf = BytecodeBuffer::new();
        buf.emit_instruction(Opcode::JumpIfNotR, &[0]);
        let patch = buf.allocate_jump_placeholder(Opcode::JumpIfNotR).unwrap();
        let body_start = buf.count();
        buf.emit_instruction(Opcode::PrintR, &[0]);
        let target = buf.count();
        buf.patch_jump(patch, target).unwrap();
        assert!(buf.all_patches_resolved());
        let off_bytes = [buf.code()[2], buf.code()[3]];
        let off = i16::from_le_bytes(off_bytes);
        assert_eq!(off as usize, target - body_start);
    }

    #[test]
    fn short_jump_rejects_offsets_outside_i8() {
        let mut buf = BytecodeBuffer::new();
        let patch = buf.allocate_jump_placeholder(Opcode::JumpShort).unwrap();
        for _ in 0..300 {
            buf.emit_byte(0);
        }
        let target = buf.count();
        assert!(buf.patch_jump(patch, target).is_err());
    }

    #[test]
    fn allocate_jump_placeholder_rejects_non_jump_opcodes() {
        let mut buf = BytecodeBuffer::new();
        assert!(buf.allocate_jump_placeholder(Opcode::MoveR).is_err());
    }

    #[test]
    fn constants_keep_stable_indices() {
        let mut buf = BytecodeBuffer::new();
        let a = buf.add_constant(Value::I32(1));
        let b = buf.add_constant(Value::I32(2));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(buf.constants().len(), 2);
    }

    proptest::proptest! {
        /// A `Wide` jump placeholder patched with any in-range relative
        /// offset reads back, via `i16::from_le_bytes`, as that exact offset.
        #[test]
        fn wide_patch_roundtrips_any_in_range_offset(gap in 0usize..400, extra in 0i64..200) {
            let mut buf = BytecodeBuffer::new();
            let patch = buf.allocate_jump_placeholder(Opcode::JumpIfNotR).unwrap();
            let field_end = buf.count();
            for _ in 0..gap {
                buf.emit_byte(0);
            }
            let target = (field_end as i64 + extra) as usize;
            buf.patch_jump(patch, target).unwrap();
            let off_bytes = [buf.code()[0], buf.code()[1]];
            let off = i16::from_le_bytes(off_bytes);
            assert_eq!(off as i64, target as i64 - field_end as i64);
        }
    }
}
