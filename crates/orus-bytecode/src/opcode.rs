//! The closed opcode set plus its fixed per-opcode length table.

use core::convert::TryFrom;

use crate::error::ChunkError;

/// One bytecode instruction. `repr(u8)` so the discriminant is the encoded
/// byte; see [`Opcode::operand_len`] for its fixed operand width.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// `dst, src` — boxed-register copy.
    MoveR = 0,
    /// `dst, const_idx(u16)` — load a boxed constant.
    LoadConstR = 1,
    /// `dst, const_idx(u16)` — load into both the i32 shadow bank and the boxed register.
    LoadI32Const = 2,
    /// `dst, value(u8 bool)`.
    LoadBoolR = 3,

    /// `dst, a, b` — boxed i32 add with automatic widening to i64/f64.
    AddI32R = 4,
    /// `dst, a, b` — boxed i32 subtract with automatic widening.
    SubI32R = 5,
    /// `dst, a, b` — boxed i32 multiply with automatic widening.
    MulI32R = 6,
    /// `dst, a, b` — shadow-bank i32 add, no tag checks.
    AddI32Typed = 7,
    /// `dst, a, b` — shadow-bank i32 subtract, no tag checks.
    SubI32Typed = 8,
    /// `dst, a, b` — shadow-bank i32 multiply, no tag checks.
    MulI32Typed = 9,
    /// `dst, imm(i32 LE)` — shadow-bank i32 add of a 4-byte immediate.
    AddI32Imm = 10,
    /// `dst, imm(i32 LE)`.
    SubI32Imm = 11,
    /// `dst, imm(i32 LE)`.
    MulI32Imm = 12,

    /// `dst, a, b` — structural equality, boxed registers.
    EqR = 13,
    /// `dst, a, b`.
    NeR = 14,
    /// `dst, a, b`.
    LtR = 15,
    /// `dst, a, b`.
    LeR = 16,
    /// `dst, a, b`.
    GtR = 17,
    /// `dst, a, b`.
    GeR = 18,

    /// `reg` — fast increment-by-one for `x = x + 1` on an integer register.
    IncTChecked = 19,

    /// `reg, off16` — type-error if `reg` isn't bool; branches when false.
    JumpIfNotR = 20,
    /// `a, b, off16` — branches iff `a >= b` as i32.
    JumpIfNotI32Typed = 21,
    /// `loop_id_hi, loop_id_lo, reg, off16` — bool test tagged with a loop correlation id.
    BranchTyped = 22,
    /// `off16` — unconditional forward/backward jump.
    Jump = 23,
    /// `off8` — unconditional jump, short form.
    JumpShort = 24,
    /// `distance(u8)` — unconditional back-jump: unsigned magnitude (0..=255)
    /// subtracted from `ip`, not a signed relative offset like the other jump
    /// opcodes. Picked by the compiler over `Jump` whenever a loop's back-edge
    /// distance fits in a byte.
    LoopShort = 25,
    /// `off8` — unconditional back-jump, short form (continue-to-start path).
    JumpBackShort = 26,
    /// `reg, limit_reg, off16` — fused increment/compare/branch for counter loops.
    IncCmpJmp = 27,

    /// `dst, src` — fetches a RangeIterator value, type-errors otherwise.
    GetIterR = 28,
    /// `dst, iter, has_value_reg`.
    IterNextR = 29,

    /// `dst, a, b` — rope concatenation without flattening.
    ConcatR = 30,

    /// `reg` — print with trailing newline.
    PrintR = 31,
    /// `reg` — print without trailing newline.
    PrintNoNlR = 32,
    /// `first, count, newline(u8 bool)` — print `count` registers space-separated.
    PrintMultiR = 33,

    /// `func_reg, first_arg, arg_count, result_reg`.
    CallR = 34,
    /// `reg` — return a value.
    ReturnR = 35,
    /// no operands — return without a value.
    ReturnVoid = 36,
    /// `func_reg, first_arg, arg_count` — reuses the current frame.
    TailCallR = 37,

    /// `dst, func_reg, upvalue_count` followed by `upvalue_count` `(is_local, index)`
    /// pairs. Variable length; see [`Opcode::operand_len`].
    ClosureR = 38,
    /// `dst, idx`.
    GetUpvalueR = 39,
    /// `idx, src`.
    SetUpvalueR = 40,
    /// `reg` — graduates open upvalues at or above `reg`.
    CloseUpvalueR = 41,

    /// `catch_operand(0xFF = unbound), off16`.
    TryBegin = 42,
    /// no operands.
    TryEnd = 43,

    /// `dst` — reads a monotonic clock into a register.
    TimeStamp = 44,
    /// `dst, a, b` — boxed division with automatic widening; divisor zero raises a value error.
    DivI32R = 45,
    /// `dst, a, b` — boxed modulo with automatic widening; divisor zero raises a value error.
    ModI32R = 46,

    /// `dst, first_elem, count` — builds an array from a contiguous run of registers.
    NewArrayR = 47,
    /// `dst, base, index` — array element or struct field read by ordinal; type/bounds-checked.
    IndexGetR = 48,
    /// `base, index, value` — array element or struct field write by ordinal; type/bounds-checked.
    IndexSetR = 49,
    /// `dst, desc_const(u16), first_arg, arg_count` — builds an enum instance; `desc_const`
    /// indexes a constant pool entry naming the enum type, variant, and variant ordinal.
    NewEnumR = 50,

    /// no operands — halts the dispatch loop.
    Halt = 51,
}

/// Offset-field width a jump/branch opcode reserves for `patch_jump`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JumpWidth {
    /// A signed 8-bit offset (`off8`).
    Short,
    /// A signed 16-bit offset (`off16`).
    Wide,
}

impl JumpWidth {
    /// Byte length of the reserved offset field.
    pub const fn byte_len(self) -> usize {
        match self {
            JumpWidth::Short => 1,
            JumpWidth::Wide => 2,
        }
    }
}

impl Opcode {
    /// Fixed operand byte length (excluding the opcode byte itself), or
    /// `None` for [`Opcode::ClosureR`], whose length depends on its
    /// upvalue count and must be computed by the caller.
    pub const fn operand_len(self) -> Option<usize> {
        use Opcode::*;
        Some(match self {
            MoveR => 2,
            LoadConstR | LoadI32Const => 3,
            LoadBoolR => 2,
            AddI32R | SubI32R | MulI32R | DivI32R | ModI32R => 3,
            AddI32Typed | SubI32Typed | MulI32Typed => 3,
            AddI32Imm | SubI32Imm | MulI32Imm => 5,
            EqR | NeR | LtR | LeR | GtR | GeR => 3,
            IncTChecked => 1,
            JumpIfNotR => 3,
            JumpIfNotI32Typed => 4,
            BranchTyped => 5,
            Jump => 2,
            JumpShort | LoopShort | JumpBackShort => 1,
            IncCmpJmp => 4,
            GetIterR => 2,
            IterNextR => 3,
            ConcatR => 3,
            PrintR | PrintNoNlR => 1,
            PrintMultiR => 3,
            CallR => 4,
            ReturnR => 1,
            ReturnVoid => 0,
            TailCallR => 3,
            ClosureR => return None,
            GetUpvalueR => 2,
            SetUpvalueR => 2,
            CloseUpvalueR => 1,
            TryBegin => 3,
            TryEnd => 0,
            TimeStamp => 1,
            NewArrayR | IndexGetR | IndexSetR => 3,
            NewEnumR => 5,
            Halt => 0,
        })
    }

    /// The width of the offset field this opcode reserves via
    /// `allocate_jump_placeholder`, or `None` if it isn't a jump/branch opcode.
    pub const fn jump_width(self) -> Option<JumpWidth> {
        use Opcode::*;
        match self {
            JumpIfNotR | JumpIfNotI32Typed | BranchTyped | Jump | IncCmpJmp | TryBegin => {
                Some(JumpWidth::Wide)
            }
            JumpShort | LoopShort | JumpBackShort => Some(JumpWidth::Short),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ChunkError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use Opcode::*;
        Ok(match byte {
            0 => MoveR,
            1 => LoadConstR,
            2 => LoadI32Const,
            3 => LoadBoolR,
            4 => AddI32R,
            5 => SubI32R,
            6 => MulI32R,
            7 => AddI32Typed,
            8 => SubI32Typed,
            9 => MulI32Typed,
            10 => AddI32Imm,
            11 => SubI32Imm,
            12 => MulI32Imm,
            13 => EqR,
            14 => NeR,
            15 => LtR,
            16 => LeR,
            17 => GtR,
            18 => GeR,
            19 => IncTChecked,
            20 => JumpIfNotR,
            21 => JumpIfNotI32Typed,
            22 => BranchTyped,
            23 => Jump,
            24 => JumpShort,
            25 => LoopShort,
            26 => JumpBackShort,
            27 => IncCmpJmp,
            28 => GetIterR,
            29 => IterNextR,
            30 => ConcatR,
            31 => PrintR,
            32 => PrintNoNlR,
            33 => PrintMultiR,
            34 => CallR,
            35 => ReturnR,
            36 => ReturnVoid,
            37 => TailCallR,
            38 => ClosureR,
            39 => GetUpvalueR,
            40 => SetUpvalueR,
            41 => CloseUpvalueR,
            42 => TryBegin,
            43 => TryEnd,
            44 => TimeStamp,
            45 => DivI32R,
            46 => ModI32R,
            47 => NewArrayR,
            48 => IndexGetR,
            49 => IndexSetR,
            50 => NewEnumR,
            51 => Halt,
            other => return Err(ChunkError::InvalidOpcode(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn every_opcode_roundtrips_through_its_byte() {
        for byte in 0..=51u8 {
            let op = Opcode::try_from(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert!(Opcode::try_from(52u8).is_err());
    }

    #[test]
    fn jump_opcodes_agree_with_their_reserved_width() {
        assert_eq!(Opcode::JumpShort.jump_width(), Some(JumpWidth::Short));
        assert_eq!(Opcode::Jump.jump_width(), Some(JumpWidth::Wide));
        assert_eq!(Opcode::MoveR.jump_width(), None);
    }
}
