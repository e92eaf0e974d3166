//! C9 Call/Exception Mechanics: the call-frame and try-frame stacks the
//! dispatch core pushes and pops as it runs.

#[cfg(feature = "std")]
use std::rc::Rc;

#[cfg(not(feature = "std"))]
use alloc::rc::Rc;

#[cfg(feature = "std")]
use std::vec::Vec;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use orus_bytecode::{Chunk, Function};
use orus_core::ObjHandle;

/// One module's compiled bytecode plus its function table, as handed to the
/// VM by whatever assembled it (a module loader, a test harness). Distinct
/// from the compiler's own `CompileUnit` so this crate never has to depend
/// on `orus-compiler`.
#[derive(Debug)]
pub struct LoadedModule {
    /// The bytecode shared by every function compiled from this module.
    pub chunk: Rc<Chunk>,
    /// Every function compiled from this module, including the synthesized
    /// `"<module>"` top-level at `module_function_index`.
    pub functions: Vec<Function>,
    /// Index into `functions` of the synthesized module top-level.
    pub module_function_index: u32,
    /// First VM-global function-table index this module's functions occupy.
    /// `Value::Function` constants in `chunk` are module-local; a reader adds
    /// this offset the moment such a constant is loaded into a register, so
    /// the value is globally meaningful from then on (including once copied
    /// across a module boundary by an import). Set by
    /// `Vm::instantiate_module`; zero until then.
    pub function_base: u32,
}

impl LoadedModule {
    /// The function descriptor `function_index` names.
    pub fn function(&self, function_index: u32) -> &Function {
        &self.functions[function_index as usize]
    }
}

/// One active activation record. `base` is the absolute index into the VM's
/// flat register stack where this frame's register 0 lives; every decoded
/// register operand is `base + operand`.
#[derive(Clone, Debug)]
pub struct CallFrame {
    /// The module this frame's function was compiled from.
    pub module: Rc<LoadedModule>,
    /// Index into `module.functions` this frame is running.
    pub function_index: u32,
    /// Next byte to decode.
    pub ip: u32,
    /// Absolute start of this frame's register window.
    pub base: u32,
    /// This frame's register window size (its function's `register_count`).
    pub register_count: u8,
    /// The closure this frame is running as, if its function captured any
    /// upvalues. `None` for a bare, zero-upvalue `Function` call.
    pub closure: Option<ObjHandle>,
    /// Absolute register in the *caller's* frame the return value lands in.
    /// `None` when nothing in bytecode called into this frame: the
    /// outermost module frame, or a function called directly from the host.
    pub result_register: Option<u32>,
    /// `true` for the one frame `run_module_init` pushes for a module's own
    /// top-level activation. Its register window is permanent: frame release
    /// neither truncates `registers` nor closes upvalues into it, since
    /// sibling functions keep reading/writing through those slots for as
    /// long as the module is loaded.
    pub is_module: bool,
}

impl CallFrame {
    /// Absolute physical register index for operand `r` as seen by this
    /// frame's own bytecode.
    pub fn absolute(&self, r: u8) -> u32 {
        self.base + u32::from(r)
    }

    /// This frame's function descriptor.
    pub fn function(&self) -> &Function {
        self.module.function(self.function_index)
    }

    /// This frame's chunk.
    pub fn chunk(&self) -> &Chunk {
        &self.module.chunk
    }
}

/// A pushed `try`/`catch` handler, consulted by the raise/unwind path.
#[derive(Clone, Debug)]
pub struct TryFrame {
    /// Where to resume execution once unwound to this handler.
    pub handler_ip: u32,
    /// Absolute register to store the caught error in, or `None` for an
    /// unbound catch (`catch_operand == 0xFF`).
    pub catch_register: Option<u32>,
    /// Call-frame stack depth (`frames.len()`) at the time this handler was
    /// pushed; raising unwinds the call stack back to exactly this depth.
    pub frame_depth: usize,
}
