//! A contiguous unit of bytecode plus the functions compiled into it.

#[cfg(feature = "std")]
use std::{rc::Rc, string::String};

#[cfg(not(feature = "std"))]
use alloc::{rc::Rc, string::String};

use crate::buffer::BytecodeBuffer;

/// A contiguous unit of bytecode, executed by switching `ip` and `chunk`.
/// Multiple functions compiled together (a module's top level and its
/// nested/local functions) may share one chunk, each starting at its own
/// [`Function::start_offset`].
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    /// The buffer backing this chunk.
    pub buffer: BytecodeBuffer,
}

impl Chunk {
    /// An empty chunk.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A compiled function: its name, arity, the chunk holding its bytecode, and
/// where within that chunk its body begins.
#[derive(Clone, Debug)]
pub struct Function {
    /// Declared or synthesized name (`"<script>"` for a module's top level).
    pub name: String,
    /// Parameter count.
    pub arity: u32,
    /// The chunk this function's body was compiled into.
    pub chunk: Rc<Chunk>,
    /// Byte offset within `chunk` where this function's first instruction lives.
    pub start_offset: u32,
    /// How many registers this function's own register file allocated at
    /// its high-water mark; the caller sizes the callee's frame from this.
    pub register_count: u8,
    /// The native registry key the VM patches into this function stub at
    /// load time, for an intrinsic export with no compiled body of its own.
    pub intrinsic_symbol: Option<String>,
}

impl Function {
    /// Builds a function descriptor over an existing chunk.
    pub fn new(name: impl Into<String>, arity: u32, chunk: Rc<Chunk>, start_offset: u32) -> Self {
        Function {
            name: name.into(),
            arity,
            chunk,
            start_offset,
            register_count: 0,
            intrinsic_symbol: None,
        }
    }

    /// Builds a function descriptor with its register high-water mark and
    /// optional intrinsic binding already known.
    pub fn with_metadata(
        name: impl Into<String>,
        arity: u32,
        chunk: Rc<Chunk>,
        start_offset: u32,
        register_count: u8,
        intrinsic_symbol: Option<String>,
    ) -> Self {
        Function { name: name.into(), arity, chunk, start_offset, register_count, intrinsic_symbol }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn functions_can_share_one_chunk_at_different_offsets() {
        let chunk = Rc::new(Chunk::new());
        let top = Function::new("<script>", 0, chunk.clone(), 0);
        let nested = Function::new("helper", 2, chunk.clone(), 40);
        assert_eq!(Rc::strong_count(&chunk), 3);
        assert_ne!(top.start_offset, nested.start_offset);
    }

    #[test]
    fn with_metadata_records_register_count_and_intrinsic_symbol() {
        let chunk = Rc::new(Chunk::new());
        let f = Function::with_metadata("runtime.raise", 1, chunk, 0, 1, Some("runtime.raise".into()));
        assert_eq!(f.register_count, 1);
        assert_eq!(f.intrinsic_symbol.as_deref(), Some("runtime.raise"));
    }
}
