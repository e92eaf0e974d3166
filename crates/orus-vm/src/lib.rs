//! orus-vm — the register-machine dispatch core (C8) and its call/exception
//! mechanics (C9).
//!
//! [`Vm`] owns one flat, VM-wide register stack (`registers: Vec<Value>`)
//! rather than per-frame arrays. A module's top-level `"<module>"` frame
//! ([`Vm::instantiate_module`]/[`Vm::run_module_init`]) reserves a permanent
//! window at the bottom of that stack and never truncates it: sibling
//! functions keep reaching its consts/fn-values for as long as the module is
//! loaded, via upvalues whose `slot` is simply an absolute index into this
//! same vector. Ordinary calls ([`Opcode::CallR`]) push a transient window on
//! top and truncate it back off on return — safe because every upvalue that
//! still points into a frame being released is graduated (its value copied
//! out, the frame reference severed) before truncation, whether or not the
//! bytecode itself contains an `OP_CLOSE_UPVALUE_R`.
//!
//! `Value::Function`/`ObjClosure::function_index` are indices into one
//! VM-wide function table, not into any one module's own function list (see
//! [`orus_core::Value::Function`]'s doc comment). [`Vm::instantiate_module`]
//! is the seam that makes this true: it relocates the module's freshly
//! compiled constant pool from module-local to VM-global indices before any
//! of its bytecode runs, so a later `use`-imported function value calls
//! correctly from whichever module it ends up copied into.
//!
//! Features:
//! - `std` (default): enables the `thiserror`-based error impls via `errors`.
//! - `errors`: `thiserror::Error` derive on [`RuntimeError`]/[`NativeError`]-adjacent diagnostics.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{format, rc::Rc, string::ToString, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{format, rc::Rc, string::ToString, vec::Vec};

use core::convert::TryFrom;

use orus_bytecode::Opcode;
use orus_core::{
    print_value, values_equal, ErrorKind, Heap, ObjArray, ObjArrayIterator, ObjClosure,
    ObjEnumInstance, ObjError, ObjHandle, ObjRangeIterator, ObjUpvalue, SrcLocation, UpvalueState,
    Value,
};
use orus_natives::NativeRegistry;

/// Diagnostics this crate raises.
pub mod error;
/// Call-frame, try-frame, and loaded-module bookkeeping the dispatch loop pushes and pops.
pub mod frame;

pub use error::{RuntimeError, VmResult};
pub use frame::{CallFrame, LoadedModule, TryFrame};

/// Default call-stack depth limit; overridable via [`Vm::with_frames_max`].
pub const DEFAULT_FRAMES_MAX: usize = 1024;

/// One global function-table slot: which module owns this index and the
/// local index within that module's own function list.
struct GlobalFunctionSlot {
    module: Rc<LoadedModule>,
    local_index: u32,
}

/// A module reserved in the VM's register stack and function table, ready
/// for [`Vm::run_module_init`].
#[derive(Clone)]
pub struct ModuleInstance {
    module: Rc<LoadedModule>,
    /// Absolute start of this module's permanent register window.
    pub base: u32,
    /// This module's top-level register window size.
    pub register_count: u8,
    /// First VM-global function-table index this module's functions occupy.
    pub function_base: u32,
}

/// The register-machine interpreter: heap, flat register stack, call/try
/// frame stacks, the VM-global function table, and the native registry.
pub struct Vm {
    heap: Heap,
    registers: Vec<Value>,
    frames: Vec<CallFrame>,
    try_frames: Vec<TryFrame>,
    open_upvalues: Vec<ObjHandle>,
    functions: Vec<GlobalFunctionSlot>,
    natives: NativeRegistry,
    frames_max: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A fresh VM with no natives registered beyond what `NativeRegistry::new` provides.
    pub fn new() -> Self {
        Vm::with_natives(NativeRegistry::new())
    }

    /// A fresh VM backed by a caller-supplied native registry (e.g.
    /// [`NativeRegistry::with_defaults`], or one preloaded with test doubles).
    pub fn with_natives(natives: NativeRegistry) -> Self {
        Vm {
            heap: Heap::new(),
            registers: Vec::new(),
            frames: Vec::new(),
            try_frames: Vec::new(),
            open_upvalues: Vec::new(),
            functions: Vec::new(),
            natives,
            frames_max: DEFAULT_FRAMES_MAX,
        }
    }

    /// Overrides the call-stack depth limit.
    pub fn with_frames_max(mut self, frames_max: usize) -> Self {
        self.frames_max = frames_max;
        self
    }

    /// The heap backing this VM's reference-identity values.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access, for a host seeding `env` or inspecting results.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The native registry backing this VM's intrinsic-bound functions.
    pub fn natives_mut(&mut self) -> &mut NativeRegistry {
        &mut self.natives
    }

    /// Absolute register read, for a loader copying an already-loaded
    /// module's export into a freshly instantiated importer's frame.
    pub fn read_register(&self, abs: u32) -> &Value {
        &self.registers[abs as usize]
    }

    /// Absolute register write; see [`Self::read_register`].
    pub fn write_register(&mut self, abs: u32, value: Value) {
        self.registers[abs as usize] = value;
    }

    /// Reserves a module's permanent register window and function-table
    /// slots and records its global function-index offset. Does not run
    /// anything; call [`Self::run_module_init`] next.
    pub fn instantiate_module(&mut self, mut module: LoadedModule) -> ModuleInstance {
        let function_base = self.functions.len() as u32;
        module.function_base = function_base;

        let module = Rc::new(module);
        for local_index in 0..module.functions.len() as u32 {
            self.functions.push(GlobalFunctionSlot { module: module.clone(), local_index });
        }

        let register_count = module.function(module.module_function_index).register_count;
        let base = self.registers.len() as u32;
        self.registers.resize(self.registers.len() + register_count as usize, Value::Bool(false));

        ModuleInstance { module, base, register_count, function_base }
    }

    /// Runs a module's `"<module>"` top-level to completion. Requires no
    /// call to already be in flight (module inits run one at a time).
    pub fn run_module_init(&mut self, inst: &ModuleInstance) -> VmResult<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(base = inst.base, register_count = inst.register_count, "running module init");
        debug_assert!(self.frames.is_empty(), "module inits never overlap a pending call");
        let function = inst.module.function(inst.module.module_function_index);
        self.frames.push(CallFrame {
            module: inst.module.clone(),
            function_index: inst.module.module_function_index,
            ip: function.start_offset,
            base: inst.base,
            register_count: inst.register_count,
            closure: None,
            result_register: None,
            is_module: true,
        });
        self.run()?;
        Ok(())
    }

    /// Calls an already-loaded function by its VM-global index from the host,
    /// outside of any bytecode call site.
    pub fn call(&mut self, global_function_index: u32, args: &[Value]) -> VmResult<Value> {
        self.push_call(global_function_index, None, args, None)?;
        self.run()?.ok_or(RuntimeError::NotCallable)
    }

    // ---- frame plumbing --------------------------------------------------------

    fn current_location(&self) -> SrcLocation {
        let frame = self.frames.last().expect("dispatch only runs with an active frame");
        let line = frame.chunk().buffer.line_at(frame.ip as usize).unwrap_or(0);
        let column = frame.chunk().buffer.column_at(frame.ip as usize).unwrap_or(0);
        SrcLocation { file: inst_module_name(frame), line, column }
    }

    fn close_upvalues_from(&mut self, threshold: u32) {
        let registers = &self.registers;
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let handle = self.open_upvalues[i];
            let slot = match self.heap.upvalues.get(handle.0) {
                Some(ObjUpvalue { state: UpvalueState::Open { slot } }) => Some(*slot),
                _ => None,
            };
            match slot {
                Some(slot) if slot >= threshold => {
                    let value = registers[slot as usize].clone();
                    if let Some(uv) = self.heap.upvalues.get_mut(handle.0) {
                        uv.close(value);
                    }
                    self.open_upvalues.swap_remove(i);
                }
                Some(_) => i += 1,
                None => {
                    self.open_upvalues.swap_remove(i);
                }
            }
        }
    }

    /// Pushes a new call frame for `global_function_index`, copying `args`
    /// into its register window. `closure` is the closure value the callee
    /// was invoked through, if any; `result_register` is where the caller
    /// wants the return value (absolute), or `None` for a host-level call.
    fn push_call(
        &mut self,
        global_function_index: u32,
        closure: Option<ObjHandle>,
        args: &[Value],
        result_register: Option<u32>,
    ) -> VmResult<()> {
        if self.frames.len() >= self.frames_max {
            return self.fault(RuntimeError::StackOverflow);
        }
        let slot = &self.functions[global_function_index as usize];
        let module = slot.module.clone();
        let function = module.function(slot.local_index);

        if let Some(intrinsic) = function.intrinsic_symbol.clone() {
            let result = if intrinsic == "runtime.raise" {
                let arg = args.first().cloned().unwrap_or(Value::Bool(false));
                let message = print_value(&self.heap, &arg);
                let location = self.current_location();
                let err = ObjError { kind: ErrorKind::User, message, location };
                let handle = self.heap.errors.insert(err);
                return self.raise_and_unwind(Value::Error(ObjHandle(handle)));
            } else {
                self.natives.call(&intrinsic, args, &mut self.heap).map_err(|e| RuntimeError::Native(e.to_string()))
            };
            match result {
                Ok(value) => {
                    if let Some(r) = result_register {
                        self.registers[r as usize] = value;
                    } else {
                        self.registers.push(value);
                    }
                    return Ok(());
                }
                Err(e) => return self.fault(e),
            }
        }

        if args.len() as u32 != function.arity {
            return self.fault(RuntimeError::Arity { expected: function.arity, got: args.len() });
        }

        let base = self.registers.len() as u32;
        self.registers.resize(self.registers.len() + function.register_count as usize, Value::Bool(false));
        for (i, arg) in args.iter().enumerate() {
            self.registers[base as usize + i] = arg.clone();
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(function_index = global_function_index, depth = self.frames.len(), "call");
        self.frames.push(CallFrame {
            module: module.clone(),
            function_index: slot.local_index,
            ip: function.start_offset,
            base,
            register_count: function.register_count,
            closure,
            result_register,
            is_module: false,
        });
        Ok(())
    }

    /// Returns `value` from the current frame: either writes it into the
    /// caller's `result_register` and resumes the caller, or (module frame /
    /// host call) hands it back to [`Self::run`]'s caller.
    /// `value` is `None` for a void return: spec.md §4.8 requires the
    /// caller's result register to be left untouched in that case, not
    /// overwritten with a placeholder.
    fn do_return(&mut self, value: Option<Value>) -> VmResult<Option<Value>> {
        #[cfg(feature = "tracing")]
        tracing::trace!(depth = self.frames.len(), "return");
        let frame = self.frames.pop().expect("return always runs inside a frame");
        if !frame.is_module {
            self.close_upvalues_from(frame.base);
            self.registers.truncate(frame.base as usize);
        }
        match frame.result_register {
            Some(r) => {
                if let Some(v) = value {
                    self.registers[r as usize] = v;
                }
                Ok(None)
            }
            None => Ok(Some(value.unwrap_or(Value::Bool(false)))),
        }
    }

    /// Raises `error` (always a `Value::Error`), unwinding to the nearest
    /// active try frame. Frames between the raise site and the handler are
    /// released exactly like a normal return would release them.
    fn raise(&mut self, error: Value) -> VmResult<()> {
        loop {
            match self.try_frames.last() {
                Some(t) if self.frames.len() >= t.frame_depth => {
                    let t = self.try_frames.pop().expect("checked above");
                    while self.frames.len() > t.frame_depth {
                        let frame = self.frames.pop().expect("loop bound guarantees a frame");
                        if !frame.is_module {
                            self.close_upvalues_from(frame.base);
                            self.registers.truncate(frame.base as usize);
                        }
                    }
                    let frame = self.frames.last_mut().expect("try frame depth never exceeds live frames");
                    frame.ip = t.handler_ip;
                    if let Some(reg) = t.catch_register {
                        self.registers[reg as usize] = error;
                    }
                    #[cfg(feature = "tracing")]
                    tracing::debug!(depth = self.frames.len(), "caught");
                    return Ok(());
                }
                _ => {
                    let message = match &error {
                        Value::Error(h) => self
                            .heap
                            .errors
                            .get(h.0)
                            .map(|e| e.message.clone())
                            .unwrap_or_default(),
                        other => print_value(&self.heap, other),
                    };
                    let kind = match &error {
                        Value::Error(h) => self.heap.errors.get(h.0).map(|e| e.kind).unwrap_or(ErrorKind::Runtime),
                        _ => ErrorKind::Runtime,
                    };
                    return Err(RuntimeError::Unhandled { kind, message });
                }
            }
        }
    }

    /// Raises `error`, converting a caught exception into [`RuntimeError::Handled`]
    /// so the current opcode handler unwinds via `?` without acting on any
    /// value it computed before the raise — the frame it was about to write
    /// into may no longer be the active one.
    fn raise_and_unwind<T>(&mut self, error: Value) -> VmResult<T> {
        match self.raise(error) {
            Ok(()) => Err(RuntimeError::Handled),
            Err(unhandled) => Err(unhandled),
        }
    }

    /// Builds an `ObjError` from an internal dispatch failure and raises it.
    fn fault<T>(&mut self, err: RuntimeError) -> VmResult<T> {
        let kind = err.kind();
        let message = format!("{err}");
        let location = self.current_location();
        let obj = ObjError { kind, message, location };
        let handle = self.heap.errors.insert(obj);
        self.raise_and_unwind(Value::Error(ObjHandle(handle)))
    }

    // ---- dispatch ---------------------------------------------------------------

    /// Runs until the entry frame returns (or the program halts), returning
    /// whatever value that frame hands back to its caller (`None` for a
    /// module init, `Some` for a function called via [`Self::call`]).
    fn run(&mut self) -> VmResult<Option<Value>> {
        let entry_depth = self.frames.len() - 1;
        loop {
            if self.frames.len() <= entry_depth {
                return Ok(None);
            }
            match self.step() {
                Ok(Some(outcome)) => {
                    if self.frames.len() <= entry_depth {
                        return Ok(Some(outcome));
                    }
                }
                Ok(None) => {}
                Err(RuntimeError::Handled) => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("step only runs with an active frame");
        let code = frame.chunk().buffer.code();
        let b = code[frame.ip as usize];
        frame.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    fn read_i32(&mut self) -> i32 {
        let b0 = self.read_u8();
        let b1 = self.read_u8();
        let b2 = self.read_u8();
        let b3 = self.read_u8();
        i32::from_le_bytes([b0, b1, b2, b3])
    }

    fn abs(&self, r: u8) -> u32 {
        self.frames.last().expect("reg decode only runs with an active frame").absolute(r)
    }

    fn get(&self, r: u8) -> Value {
        self.registers[self.abs(r) as usize].clone()
    }

    fn set(&mut self, r: u8, v: Value) {
        let a = self.abs(r);
        self.registers[a as usize] = v;
    }

    fn jump_by(&mut self, offset: i32) {
        let frame = self.frames.last_mut().expect("jump only runs with an active frame");
        frame.ip = (frame.ip as i64 + offset as i64) as u32;
    }

    /// Decodes and executes one instruction. Returns `Some(value)` once the
    /// entry frame has returned or the program halted.
    fn step(&mut self) -> VmResult<Option<Value>> {
        let op_byte = self.read_u8();
        let opcode = Opcode::try_from(op_byte).map_err(RuntimeError::from)?;

        match opcode {
            Opcode::MoveR => {
                let (dst, src) = (self.read_u8(), self.read_u8());
                let v = self.get(src);
                self.set(dst, v);
                Ok(None)
            }
            Opcode::LoadConstR | Opcode::LoadI32Const => {
                let dst = self.read_u8();
                let idx = self.read_u16();
                let frame = self.frames.last().unwrap();
                let function_base = frame.module.function_base;
                let mut v = frame.chunk().buffer.constants()[idx as usize].clone();
                if let Value::Function(idx) = &mut v {
                    *idx += function_base;
                }
                self.set(dst, v);
                Ok(None)
            }
            Opcode::LoadBoolR => {
                let (dst, v) = (self.read_u8(), self.read_u8());
                self.set(dst, Value::Bool(v != 0));
                Ok(None)
            }

            Opcode::AddI32R => self.boxed_arith(|a, b| a.checked_add(b), |a, b| a + b, |a, b| a.checked_add(b)),
            Opcode::SubI32R => self.boxed_arith(|a, b| a.checked_sub(b), |a, b| a - b, |a, b| a.checked_sub(b)),
            Opcode::MulI32R => self.boxed_arith(|a, b| a.checked_mul(b), |a, b| a * b, |a, b| a.checked_mul(b)),

            Opcode::DivI32R => self.div_mod_arith(true),
            Opcode::ModI32R => self.div_mod_arith(false),

            Opcode::AddI32Typed => self.typed_arith(i32::wrapping_add),
            Opcode::SubI32Typed => self.typed_arith(i32::wrapping_sub),
            Opcode::MulI32Typed => self.typed_arith(i32::wrapping_mul),
            Opcode::AddI32Imm => self.typed_imm(i32::wrapping_add),
            Opcode::SubI32Imm => self.typed_imm(i32::wrapping_sub),
            Opcode::MulI32Imm => self.typed_imm(i32::wrapping_mul),

            Opcode::EqR => self.compare(|a, b| values_equal(a, b)),
            Opcode::NeR => self.compare(|a, b| !values_equal(a, b)),
            Opcode::LtR => self.ordered_compare(|o| o.is_lt()),
            Opcode::LeR => self.ordered_compare(|o| o.is_le()),
            Opcode::GtR => self.ordered_compare(|o| o.is_gt()),
            Opcode::GeR => self.ordered_compare(|o| o.is_ge()),

            Opcode::IncTChecked => {
                let reg = self.read_u8();
                let n = self.as_i32(reg)?;
                match n.checked_add(1) {
                    Some(v) => self.set(reg, Value::I32(v)),
                    None => return self.fault(RuntimeError::Overflow("integer increment overflowed i32".to_string())),
                }
                Ok(None)
            }

            Opcode::JumpIfNotR => {
                let reg = self.read_u8();
                let off = self.read_i16();
                let cond = self.as_bool(reg)?;
                if !cond {
                    self.jump_by(off as i32);
                }
                Ok(None)
            }
            Opcode::JumpIfNotI32Typed => {
                let (a, b) = (self.read_u8(), self.read_u8());
                let off = self.read_i16();
                let (av, bv) = (self.as_i32(a)?, self.as_i32(b)?);
                if av >= bv {
                    self.jump_by(off as i32);
                }
                Ok(None)
            }
            Opcode::BranchTyped => {
                let (_hi, _lo) = (self.read_u8(), self.read_u8());
                let reg = self.read_u8();
                let off = self.read_i16();
                let cond = self.as_bool(reg)?;
                if !cond {
                    self.jump_by(off as i32);
                }
                Ok(None)
            }
            Opcode::Jump => {
                let off = self.read_i16();
                self.jump_by(off as i32);
                Ok(None)
            }
            Opcode::JumpShort => {
                let off = self.read_u8() as i8;
                self.jump_by(off as i32);
                Ok(None)
            }
            Opcode::LoopShort => {
                let distance = self.read_u8();
                self.jump_by(-i32::from(distance));
                Ok(None)
            }
            Opcode::JumpBackShort => {
                let off = self.read_u8() as i8;
                self.jump_by(off as i32);
                Ok(None)
            }
            Opcode::IncCmpJmp => {
                let (reg, limit) = (self.read_u8(), self.read_u8());
                let off = self.read_i16();
                let n = self.as_i32(reg)?;
                let limit_v = self.as_i32(limit)?;
                match n.checked_add(1) {
                    Some(next) => {
                        self.set(reg, Value::I32(next));
                        if next < limit_v {
                            self.jump_by(off as i32);
                        }
                    }
                    None => return self.fault(RuntimeError::Overflow("loop counter overflowed i32".to_string())),
                }
                Ok(None)
            }

            Opcode::GetIterR => {
                let (dst, src) = (self.read_u8(), self.read_u8());
                let v = self.get(src);
                let iter = match v {
                    Value::RangeIterator(_) | Value::ArrayIterator(_) => v,
                    Value::Array(h) => Value::ArrayIterator(ObjHandle(self.heap.array_iterators.insert(ObjArrayIterator::new(h)))),
                    other => {
                        return self.fault(RuntimeError::Type { expected: "range_iterator, array_iterator, or array", found: other.type_name() })
                    }
                };
                self.set(dst, iter);
                Ok(None)
            }
            Opcode::IterNextR => {
                let (dst, iter_reg, has_reg) = (self.read_u8(), self.read_u8(), self.read_u8());
                let iter = self.get(iter_reg);
                match iter {
                    Value::RangeIterator(h) => {
                        let next = self.heap.range_iterators.get_mut(h.0).and_then(ObjRangeIterator::next);
                        match next {
                            Some(n) => {
                                self.set(dst, Value::I32(n as i32));
                                self.set(has_reg, Value::Bool(true));
                            }
                            None => self.set(has_reg, Value::Bool(false)),
                        }
                    }
                    Value::ArrayIterator(h) => {
                        let element = {
                            let it = self.heap.array_iterators.get(h.0).copied();
                            it.and_then(|it| {
                                self.heap.arrays.get(it.array.0).and_then(|arr| arr.get(it.index as usize).cloned())
                            })
                        };
                        match element {
                            Some(v) => {
                                self.set(dst, v);
                                self.set(has_reg, Value::Bool(true));
                                if let Some(it) = self.heap.array_iterators.get_mut(h.0) {
                                    it.index += 1;
                                }
                            }
                            None => self.set(has_reg, Value::Bool(false)),
                        }
                    }
                    other => return self.fault(RuntimeError::Type { expected: "iterator", found: other.type_name() }),
                }
                Ok(None)
            }

            Opcode::ConcatR => {
                let (dst, a, b) = (self.read_u8(), self.read_u8(), self.read_u8());
                let (av, bv) = (self.get(a), self.get(b));
                match (av, bv) {
                    (Value::String(x), Value::String(y)) => self.set(dst, Value::String(x.concat(&y))),
                    (x, y) => {
                        return self.fault(RuntimeError::Type {
                            expected: "string",
                            found: if !x.is_string() { x.type_name() } else { y.type_name() },
                        })
                    }
                }
                Ok(None)
            }

            Opcode::PrintR => {
                let reg = self.read_u8();
                let v = self.get(reg);
                let text = print_value(&self.heap, &v);
                self.write_stdout(&text, true);
                Ok(None)
            }
            Opcode::PrintNoNlR => {
                let reg = self.read_u8();
                let v = self.get(reg);
                let text = print_value(&self.heap, &v);
                self.write_stdout(&text, false);
                Ok(None)
            }
            Opcode::PrintMultiR => {
                let (first, count, newline) = (self.read_u8(), self.read_u8(), self.read_u8());
                let mut parts = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let v = self.get(first + i);
                    parts.push(print_value(&self.heap, &v));
                }
                self.write_stdout(&parts.join(" "), newline != 0);
                Ok(None)
            }

            Opcode::CallR => {
                let (func_reg, first_arg, arg_count, result_reg) =
                    (self.read_u8(), self.read_u8(), self.read_u8(), self.read_u8());
                let callee = self.get(func_reg);
                let args: Vec<Value> = (0..arg_count).map(|i| self.get(first_arg + i)).collect();
                let result_abs = self.abs(result_reg);
                self.dispatch_call(callee, args, Some(result_abs))?;
                Ok(None)
            }
            Opcode::TailCallR => {
                let (func_reg, first_arg, arg_count) = (self.read_u8(), self.read_u8(), self.read_u8());
                let callee = self.get(func_reg);
                let args: Vec<Value> = (0..arg_count).map(|i| self.get(first_arg + i)).collect();
                let result_register = self.frames.last().unwrap().result_register;
                let frame = self.frames.pop().expect("tail call runs inside a frame");
                if !frame.is_module {
                    self.close_upvalues_from(frame.base);
                    self.registers.truncate(frame.base as usize);
                }
                self.dispatch_call(callee, args, result_register)?;
                Ok(None)
            }
            Opcode::ReturnR => {
                let reg = self.read_u8();
                let v = self.get(reg);
                self.do_return(Some(v))
            }
            Opcode::ReturnVoid => self.do_return(None),

            Opcode::ClosureR => {
                let (dst, func_reg, upvalue_count) = (self.read_u8(), self.read_u8(), self.read_u8());
                let function_index = match self.get(func_reg) {
                    Value::Function(idx) => idx,
                    other => return self.fault(RuntimeError::Type { expected: "function", found: other.type_name() }),
                };
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    let (is_local, index) = (self.read_u8(), self.read_u8());
                    let handle = if is_local != 0 {
                        let slot = self.abs(index);
                        self.capture_upvalue(slot)
                    } else {
                        let enclosing = self.frames.last().unwrap().closure.expect("non-local upvalue requires an enclosing closure");
                        let obj = self.heap.closures.get(enclosing.0).expect("closure handle stays valid for its frame's lifetime");
                        obj.upvalues[index as usize]
                    };
                    upvalues.push(handle);
                }
                let handle = self.heap.closures.insert(ObjClosure { function_index, upvalues });
                self.set(dst, Value::Closure(ObjHandle(handle)));
                Ok(None)
            }
            Opcode::GetUpvalueR => {
                let (dst, idx) = (self.read_u8(), self.read_u8());
                let closure = self.frames.last().unwrap().closure.expect("OP_GET_UPVALUE_R requires a running closure");
                let uv_handle = self.heap.closures.get(closure.0).expect("closure stays valid").upvalues[idx as usize];
                let v = self.read_upvalue(uv_handle);
                self.set(dst, v);
                Ok(None)
            }
            Opcode::SetUpvalueR => {
                let (idx, src) = (self.read_u8(), self.read_u8());
                let v = self.get(src);
                let closure = self.frames.last().unwrap().closure.expect("OP_SET_UPVALUE_R requires a running closure");
                let uv_handle = self.heap.closures.get(closure.0).expect("closure stays valid").upvalues[idx as usize];
                self.write_upvalue(uv_handle, v);
                Ok(None)
            }
            Opcode::CloseUpvalueR => {
                let reg = self.read_u8();
                let threshold = self.abs(reg);
                self.close_upvalues_from(threshold);
                Ok(None)
            }

            Opcode::TryBegin => {
                let catch_operand = self.read_u8();
                let off = self.read_i16();
                let frame = self.frames.last().unwrap();
                let handler_ip = (frame.ip as i64 + off as i64) as u32;
                let catch_register = if catch_operand == 0xFF { None } else { Some(self.abs(catch_operand)) };
                self.try_frames.push(TryFrame { handler_ip, catch_register, frame_depth: self.frames.len() });
                Ok(None)
            }
            Opcode::TryEnd => {
                self.try_frames.pop();
                Ok(None)
            }

            Opcode::TimeStamp => {
                let dst = self.read_u8();
                self.set(dst, Value::I64(self.monotonic_millis()));
                Ok(None)
            }

            Opcode::NewArrayR => {
                let (dst, first, count) = (self.read_u8(), self.read_u8(), self.read_u8());
                let elements = (0..count).map(|i| self.get(first + i)).collect();
                let handle = self.heap.arrays.insert(ObjArray::from_vec(elements));
                self.set(dst, Value::Array(ObjHandle(handle)));
                Ok(None)
            }
            Opcode::IndexGetR => {
                let (dst, base, index) = (self.read_u8(), self.read_u8(), self.read_u8());
                let idx = self.as_i32(index)? as i64;
                let base_v = self.get(base);
                let v = self.index_get(&base_v, idx)?;
                self.set(dst, v);
                Ok(None)
            }
            Opcode::IndexSetR => {
                let (base, index, value) = (self.read_u8(), self.read_u8(), self.read_u8());
                let idx = self.as_i32(index)? as i64;
                let base_v = self.get(base);
                let v = self.get(value);
                self.index_set(&base_v, idx, v)?;
                Ok(None)
            }
            Opcode::NewEnumR => {
                let dst = self.read_u8();
                let const_idx = self.read_u16();
                let (first_arg, arg_count) = (self.read_u8(), self.read_u8());
                let desc = self.frames.last().unwrap().chunk().buffer.constants()[const_idx as usize].clone();
                let (type_name, variant_name, variant_index) = match desc {
                    Value::String(s) => {
                        let text = s.flatten_str();
                        let mut parts = text.splitn(3, "::");
                        let type_name = parts.next().unwrap_or_default().to_string();
                        let variant_name = parts.next().unwrap_or_default().to_string();
                        let variant_index: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                        (type_name, variant_name, variant_index)
                    }
                    other => return self.fault(RuntimeError::Type { expected: "enum descriptor", found: other.type_name() }),
                };
                let payload = if arg_count == 0 {
                    None
                } else {
                    let elements = (0..arg_count).map(|i| self.get(first_arg + i)).collect();
                    Some(ObjHandle(self.heap.arrays.insert(ObjArray::from_vec(elements))))
                };
                let handle = self.heap.enums.insert(ObjEnumInstance { type_name, variant_name, variant_index, payload });
                self.set(dst, Value::Enum(ObjHandle(handle)));
                Ok(None)
            }

            Opcode::Halt => self.do_return(None),
        }
    }

    fn dispatch_call(&mut self, callee: Value, args: Vec<Value>, result_abs: Option<u32>) -> VmResult<()> {
        match callee {
            Value::Function(idx) => self.push_call(idx, None, &args, result_abs),
            Value::Closure(h) => {
                let function_index = self.heap.closures.get(h.0).expect("closure handle is valid").function_index;
                self.push_call(function_index, Some(h), &args, result_abs)
            }
            other => self.fault(RuntimeError::Type { expected: "function or closure", found: other.type_name() }),
        }
    }

    fn capture_upvalue(&mut self, slot: u32) -> ObjHandle {
        for h in &self.open_upvalues {
            if let Some(ObjUpvalue { state: UpvalueState::Open { slot: s } }) = self.heap.upvalues.get(h.0) {
                if *s == slot {
                    return *h;
                }
            }
        }
        let handle = ObjHandle(self.heap.upvalues.insert(ObjUpvalue::open(slot)));
        self.open_upvalues.push(handle);
        handle
    }

    fn read_upvalue(&self, handle: ObjHandle) -> Value {
        match &self.heap.upvalues.get(handle.0).expect("upvalue handle stays valid for its closure's lifetime").state {
            UpvalueState::Open { slot } => self.registers[*slot as usize].clone(),
            UpvalueState::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, handle: ObjHandle, value: Value) {
        let slot = match &self.heap.upvalues.get(handle.0).expect("upvalue handle stays valid").state {
            UpvalueState::Open { slot } => Some(*slot),
            UpvalueState::Closed(_) => None,
        };
        match slot {
            Some(slot) => self.registers[slot as usize] = value,
            None => {
                if let Some(uv) = self.heap.upvalues.get_mut(handle.0) {
                    uv.state = UpvalueState::Closed(value);
                }
            }
        }
    }

    #[cfg(feature = "std")]
    fn write_stdout(&mut self, text: &str, newline: bool) {
        let _ = self.natives.write_stdout(text, newline);
    }

    #[cfg(not(feature = "std"))]
    fn write_stdout(&mut self, _text: &str, _newline: bool) {}

    #[cfg(feature = "std")]
    fn monotonic_millis(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
    }

    #[cfg(not(feature = "std"))]
    fn monotonic_millis(&self) -> i64 {
        0
    }

    fn as_i32(&mut self, r: u8) -> VmResult<i32> {
        match self.get(r) {
            Value::I32(n) => Ok(n),
            other => self.fault(RuntimeError::Type { expected: "i32", found: other.type_name() }),
        }
    }

    fn as_bool(&mut self, r: u8) -> VmResult<bool> {
        match self.get(r) {
            Value::Bool(b) => Ok(b),
            other => self.fault(RuntimeError::Type { expected: "bool", found: other.type_name() }),
        }
    }

    fn typed_arith(&mut self, f: impl Fn(i32, i32) -> i32) -> VmResult<Option<Value>> {
        let (dst, a, b) = (self.read_u8(), self.read_u8(), self.read_u8());
        let (av, bv) = (self.as_i32(a)?, self.as_i32(b)?);
        self.set(dst, Value::I32(f(av, bv)));
        Ok(None)
    }

    fn typed_imm(&mut self, f: impl Fn(i32, i32) -> i32) -> VmResult<Option<Value>> {
        let dst = self.read_u8();
        let imm = self.read_i32();
        let v = self.as_i32(dst)?;
        self.set(dst, Value::I32(f(v, imm)));
        Ok(None)
    }

    fn compare(&mut self, f: impl Fn(&Value, &Value) -> bool) -> VmResult<Option<Value>> {
        let (dst, a, b) = (self.read_u8(), self.read_u8(), self.read_u8());
        let (av, bv) = (self.get(a), self.get(b));
        self.set(dst, Value::Bool(f(&av, &bv)));
        Ok(None)
    }

    fn ordered_compare(&mut self, f: impl Fn(core::cmp::Ordering) -> bool) -> VmResult<Option<Value>> {
        let (dst, a, b) = (self.read_u8(), self.read_u8(), self.read_u8());
        let (av, bv) = (self.get(a), self.get(b));
        let ord = self.numeric_cmp(&av, &bv)?;
        self.set(dst, Value::Bool(f(ord)));
        Ok(None)
    }

    fn numeric_cmp(&mut self, a: &Value, b: &Value) -> VmResult<core::cmp::Ordering> {
        let (af, bf) = (self.as_f64(a)?, self.as_f64(b)?);
        match af.partial_cmp(&bf) {
            Some(o) => Ok(o),
            None => self.fault(RuntimeError::Overflow("comparison against NaN".to_string())),
        }
    }

    fn as_f64(&mut self, v: &Value) -> VmResult<f64> {
        match v {
            Value::I32(n) => Ok(f64::from(*n)),
            Value::I64(n) => Ok(*n as f64),
            Value::U32(n) => Ok(f64::from(*n)),
            Value::U64(n) => Ok(*n as f64),
            Value::F64(n) => Ok(*n),
            other => self.fault(RuntimeError::Type { expected: "numeric", found: other.type_name() }),
        }
    }

    /// Generic boxed `I32_R` arithmetic: i32 (checked) → i64 (checked) → f64, per operand tags.
    fn boxed_arith(
        &mut self,
        i32_op: impl Fn(i32, i32) -> Option<i32>,
        f64_op: impl Fn(f64, f64) -> f64,
        i64_op: impl Fn(i64, i64) -> Option<i64>,
    ) -> VmResult<Option<Value>> {
        let (dst, a, b) = (self.read_u8(), self.read_u8(), self.read_u8());
        let (av, bv) = (self.get(a), self.get(b));
        let result = match (&av, &bv) {
            (Value::I32(x), Value::I32(y)) => match i32_op(*x, *y) {
                Some(v) => Value::I32(v),
                None => match i64_op(i64::from(*x), i64::from(*y)) {
                    Some(v) => Value::I64(v),
                    None => return self.fault(RuntimeError::Overflow("i32 arithmetic overflowed i64".to_string())),
                },
            },
            (Value::I64(_), Value::I64(_)) | (Value::I32(_), Value::I64(_)) | (Value::I64(_), Value::I32(_)) => {
                let (x, y) = (self.as_i64(&av)?, self.as_i64(&bv)?);
                match i64_op(x, y) {
                    Some(v) => Value::I64(v),
                    None => return self.fault(RuntimeError::Overflow("i64 arithmetic overflowed".to_string())),
                }
            }
            (Value::F64(_), _) | (_, Value::F64(_)) => {
                let (x, y) = (self.as_f64(&av)?, self.as_f64(&bv)?);
                Value::F64(f64_op(x, y))
            }
            _ => return self.fault(RuntimeError::Type { expected: "numeric", found: if !av.is_i32() && !av.is_i64() && !av.is_f64() { av.type_name() } else { bv.type_name() } }),
        };
        self.set(dst, result);
        Ok(None)
    }

    fn as_i64(&mut self, v: &Value) -> VmResult<i64> {
        match v {
            Value::I32(n) => Ok(i64::from(*n)),
            Value::I64(n) => Ok(*n),
            other => self.fault(RuntimeError::Type { expected: "i32 or i64", found: other.type_name() }),
        }
    }

    fn div_mod_arith(&mut self, is_div: bool) -> VmResult<Option<Value>> {
        let (dst, a, b) = (self.read_u8(), self.read_u8(), self.read_u8());
        let (av, bv) = (self.get(a), self.get(b));
        let result = match (&av, &bv) {
            (Value::F64(_), _) | (_, Value::F64(_)) => {
                let (x, y) = (self.as_f64(&av)?, self.as_f64(&bv)?);
                Value::F64(if is_div { x / y } else { x % y })
            }
            (Value::I32(x), Value::I32(y)) => {
                if *y == 0 {
                    return self.fault(RuntimeError::DivideByZero);
                }
                if *x == i32::MIN && *y == -1 {
                    Value::I64(if is_div { i64::from(*x) / i64::from(*y) } else { 0 })
                } else if is_div {
                    Value::I32(x / y)
                } else {
                    Value::I32(x % y)
                }
            }
            (Value::I32(_), Value::I64(_)) | (Value::I64(_), Value::I32(_)) | (Value::I64(_), Value::I64(_)) => {
                let (x, y) = (self.as_i64(&av)?, self.as_i64(&bv)?);
                if y == 0 {
                    return self.fault(RuntimeError::DivideByZero);
                }
                if x == i64::MIN && y == -1 {
                    return self.fault(RuntimeError::Overflow("i64::MIN / -1 overflows i64".to_string()));
                }
                if is_div {
                    Value::I64(x / y)
                } else {
                    Value::I64(x % y)
                }
            }
            _ => return self.fault(RuntimeError::Type { expected: "numeric", found: if !av.is_i32() && !av.is_i64() && !av.is_f64() { av.type_name() } else { bv.type_name() } }),
        };
        self.set(dst, result);
        Ok(None)
    }

    fn index_get(&mut self, base: &Value, idx: i64) -> VmResult<Value> {
        match base {
            Value::Array(h) => {
                let arr = self.heap.arrays.get(h.0).expect("array handle is valid");
                let len = arr.len();
                if idx < 0 || idx as usize >= len {
                    return self.fault(RuntimeError::IndexOutOfBounds { index: idx.max(0) as usize, len });
                }
                Ok(arr.get(idx as usize).expect("bounds checked above").clone())
            }
            other => self.fault(RuntimeError::Type { expected: "array", found: other.type_name() }),
        }
    }

    fn index_set(&mut self, base: &Value, idx: i64, value: Value) -> VmResult<()> {
        match base {
            Value::Array(h) => {
                let len = self.heap.arrays.get(h.0).map(ObjArray::len).unwrap_or(0);
                if idx < 0 || idx as usize >= len {
                    return self.fault(RuntimeError::IndexOutOfBounds { index: idx.max(0) as usize, len });
                }
                self.heap.arrays.get_mut(h.0).expect("array handle is valid").set(idx as usize, value);
                Ok(())
            }
            other => self.fault(RuntimeError::Type { expected: "array", found: other.type_name() }),
        }
    }
}

fn inst_module_name(frame: &CallFrame) -> alloc_compatible_string::String {
    frame.function().name.clone()
}

#[cfg(feature = "std")]
mod alloc_compatible_string {
    pub use std::string::String;
}

#[cfg(not(feature = "std"))]
mod alloc_compatible_string {
    pub use alloc::string::String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use orus_bytecode::{BytecodeBuffer, Chunk, Function};

    #[test]
    fn fresh_vm_has_no_frames_or_registers() {
        let vm = Vm::new();
        assert!(vm.frames.is_empty());
        assert!(vm.registers.is_empty());
    }

    fn load_const(buf: &mut BytecodeBuffer, dst: u8, value: Value) {
        let idx = buf.add_constant(value) as u16;
        let b = idx.to_le_bytes();
        buf.emit_instruction(Opcode::LoadConstR, &[dst, b[0], b[1]]);
    }

    fn run_module(buf: BytecodeBuffer, register_count: u8) -> (Vm, ModuleInstance, VmResult<()>) {
        let chunk = Rc::new(Chunk { buffer: buf });
        let function = Function::with_metadata("<module>", 0, chunk.clone(), 0, register_count, None);
        let module = LoadedModule { chunk, functions: vec![function], module_function_index: 0, function_base: 0 };
        let mut vm = Vm::new();
        let inst = vm.instantiate_module(module);
        let result = vm.run_module_init(&inst);
        (vm, inst, result)
    }

    #[test]
    fn i32_min_div_and_mod_minus_one_widen_correctly() {
        let mut buf = BytecodeBuffer::new();
        load_const(&mut buf, 0, Value::I32(i32::MIN));
        load_const(&mut buf, 1, Value::I32(-1));
        buf.emit_instruction(Opcode::DivI32R, &[2, 0, 1]);
        buf.emit_instruction(Opcode::ModI32R, &[3, 0, 1]);
        buf.emit_instruction(Opcode::Halt, &[]);

        let (vm, inst, result) = run_module(buf, 4);
        result.unwrap();
        assert_eq!(*vm.read_register(inst.base + 2), Value::I64(i64::from(i32::MIN) / -1));
        assert_eq!(*vm.read_register(inst.base + 3), Value::I32(0));
    }

    #[test]
    fn uncaught_division_by_zero_surfaces_as_unhandled() {
        let mut buf = BytecodeBuffer::new();
        load_const(&mut buf, 0, Value::I32(5));
        load_const(&mut buf, 1, Value::I32(0));
        buf.emit_instruction(Opcode::DivI32R, &[2, 0, 1]);
        buf.emit_instruction(Opcode::Halt, &[]);

        let (_vm, _inst, result) = run_module(buf, 3);
        assert!(matches!(result, Err(RuntimeError::Unhandled { .. })));
    }

    #[test]
    fn a_try_block_catches_a_division_fault_without_propagating_it() {
        let mut buf = BytecodeBuffer::new();
        load_const(&mut buf, 0, Value::I32(5));
        load_const(&mut buf, 1, Value::I32(0));
        buf.emit_instruction(Opcode::TryBegin, &[2]);
        let patch = buf.allocate_jump_placeholder(Opcode::TryBegin).unwrap();
        buf.emit_instruction(Opcode::DivI32R, &[3, 0, 1]);
        buf.emit_instruction(Opcode::TryEnd, &[]);
        let handler = buf.count();
        buf.patch_jump(patch, handler).unwrap();
        buf.emit_instruction(Opcode::Halt, &[]);

        let (vm, inst, result) = run_module(buf, 4);
        result.unwrap();
        assert!(matches!(vm.read_register(inst.base + 2), Value::Error(_)));
    }

    #[test]
    fn a_call_truncates_the_callee_window_back_off_on_return() {
        let mut buf = BytecodeBuffer::new();

        let inc_start = buf.count() as u32;
        load_const(&mut buf, 1, Value::I32(1));
        buf.emit_instruction(Opcode::AddI32R, &[2, 0, 1]);
        buf.emit_instruction(Opcode::ReturnR, &[2]);

        let module_start = buf.count() as u32;
        load_const(&mut buf, 0, Value::I32(5));
        load_const(&mut buf, 1, Value::Function(0));
        buf.emit_instruction(Opcode::CallR, &[1, 0, 1, 2]);
        buf.emit_instruction(Opcode::Halt, &[]);

        let chunk = Rc::new(Chunk { buffer: buf });
        let inc_fn = Function::with_metadata("inc", 1, chunk.clone(), inc_start, 3, None);
        let module_fn = Function::with_metadata("<module>", 0, chunk.clone(), module_start, 3, None);
        let module =
            LoadedModule { chunk, functions: vec![inc_fn, module_fn], module_function_index: 1, function_base: 0 };

        let mut vm = Vm::new();
        let inst = vm.instantiate_module(module);
        let depth_before_call = vm.registers.len();
        vm.run_module_init(&inst).unwrap();

        assert_eq!(vm.registers.len(), depth_before_call);
        assert_eq!(*vm.read_register(inst.base + 2), Value::I32(6));
    }

    fn run_add_i32(x: i32, y: i32) -> Value {
        let mut buf = BytecodeBuffer::new();
        load_const(&mut buf, 0, Value::I32(x));
        load_const(&mut buf, 1, Value::I32(y));
        buf.emit_instruction(Opcode::AddI32R, &[2, 0, 1]);
        buf.emit_instruction(Opcode::Halt, &[]);
        let (vm, inst, result) = run_module(buf, 3);
        result.unwrap();
        vm.read_register(inst.base + 2).clone()
    }

    proptest::proptest! {
        /// `AddI32R` on any two `i32`s stays `I32` when the sum fits, and
        /// otherwise widens to the exact `I64` sum rather than wrapping or
        /// faulting: two `i32` operands can never overflow `i64`.
        #[test]
        fn add_i32_widens_exactly_on_overflow(x: i32, y: i32) {
            let result = run_add_i32(x, y);
            match x.checked_add(y) {
                Some(sum) => assert_eq!(result, Value::I32(sum)),
                None => assert_eq!(result, Value::I64(i64::from(x) + i64::from(y))),
            }
        }
    }
}
