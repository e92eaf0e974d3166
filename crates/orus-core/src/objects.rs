//! Heap object kinds other than the string rope: arrays, enum instances,
//! errors, upvalues, closures, and files. All are stored in
//! generation-handle arenas inside [`Heap`] so a `Value` only ever carries a
//! small `Copy` handle, never a pointer.

#[cfg(feature = "std")]
use std::{string::String, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

use core::fmt;

use orus_mm::GenArena;

use crate::Value;

/// Contiguous, length-typed element vector; backs ordinary arrays and enum
/// payloads alike.
#[derive(Clone, Debug, Default)]
pub struct ObjArray {
    /// The elements, in order.
    pub elements: Vec<Value>,
}

impl ObjArray {
    /// An empty array.
    pub fn new() -> Self {
        ObjArray { elements: Vec::new() }
    }
    /// Builds an array from an existing vector of values.
    pub fn from_vec(elements: Vec<Value>) -> Self {
        ObjArray { elements }
    }
    /// Current length.
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    /// `true` when empty.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    /// Indexed read.
    pub fn get(&self, i: usize) -> Option<&Value> {
        self.elements.get(i)
    }
    /// Indexed write; returns `false` if `i` is out of bounds.
    pub fn set(&mut self, i: usize, v: Value) -> bool {
        if let Some(slot) = self.elements.get_mut(i) {
            *slot = v;
            true
        } else {
            false
        }
    }
    /// Appends an element.
    pub fn push(&mut self, v: Value) {
        self.elements.push(v);
    }
    /// Removes and returns the last element.
    pub fn pop(&mut self) -> Option<Value> {
        self.elements.pop()
    }
    /// A shallow slice `[start, end)`, cloning the contained values.
    pub fn slice(&self, start: usize, end: usize) -> ObjArray {
        ObjArray { elements: self.elements[start.min(self.elements.len())..end.min(self.elements.len())].to_vec() }
    }
}

/// A constructed enum value: its declaring type, the chosen variant, and an
/// optional payload array (for variants carrying data).
#[derive(Clone, Debug)]
pub struct ObjEnumInstance {
    /// The enum's declared name.
    pub type_name: String,
    /// The chosen variant's name.
    pub variant_name: String,
    /// The variant's ordinal within its declaration.
    pub variant_index: u32,
    /// Handle to the payload array, if the variant carries fields.
    pub payload: Option<crate::ObjHandle>,
}

/// The error taxonomy surfaced to user code via `raise`/`catch` (distinct
/// from the host-level compile/runtime error enums the compiler and VM
/// crates define for their own propagation).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operand kind mismatch.
    Type,
    /// Overflow, division by zero, bad argument.
    Value,
    /// Undefined variable, module, or export.
    Name,
    /// Module resolution failure.
    Import,
    /// Catch-all runtime failure.
    Runtime,
    /// User-raised error via `raise`.
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Name => "NameError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::User => "Error",
        };
        write!(f, "{s}")
    }
}

/// A source location captured at the point an error was raised.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SrcLocation {
    /// Source file path, or `"<repl>"`.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

/// A raised or caught error value.
#[derive(Clone, Debug)]
pub struct ObjError {
    /// The error's taxonomy kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Where it was raised.
    pub location: SrcLocation,
}

/// Whether an upvalue still refers to a live frame slot or has graduated to
/// owning its own copy.
#[derive(Clone, Debug)]
pub enum UpvalueState {
    /// Points at `frame_base + slot` in the still-live owning frame.
    Open {
        /// Absolute register-file index the upvalue currently reads/writes through.
        slot: u32,
    },
    /// Owns its value directly; the declaring frame has returned.
    Closed(Value),
}

/// An indirection closures use to reach a variable that may outlive its
/// declaring frame.
#[derive(Clone, Debug)]
pub struct ObjUpvalue {
    /// Open-or-closed state.
    pub state: UpvalueState,
}

impl ObjUpvalue {
    /// A freshly captured, still-open upvalue.
    pub fn open(slot: u32) -> Self {
        ObjUpvalue { state: UpvalueState::Open { slot } }
    }
    /// `true` while the upvalue still points into a live frame.
    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }
    /// Graduates the upvalue, copying `value` in and severing the frame
    /// reference.
    pub fn close(&mut self, value: Value) {
        self.state = UpvalueState::Closed(value);
    }
}

/// A closure: the function it wraps plus its captured upvalues, each
/// referenced by heap handle so multiple closures can share one upvalue.
#[derive(Clone, Debug)]
pub struct ObjClosure {
    /// Index into the VM's function table.
    pub function_index: u32,
    /// Handles to this closure's captured upvalues, in declaration order.
    pub upvalues: Vec<crate::ObjHandle>,
}

/// Lifecycle state of an open file handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    /// The VM allocated and owns the underlying descriptor.
    Owned,
    /// The handle was borrowed from the host and won't be closed by GC.
    Borrowed,
    /// `close()` has already run.
    Closed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileState::Owned => "owned",
            FileState::Borrowed => "borrowed",
            FileState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// An open file handle.
#[derive(Clone, Debug)]
pub struct ObjFile {
    /// The path it was opened from.
    pub path: String,
    /// Ownership/lifecycle state.
    pub state: FileState,
}

/// State of a `start..limit` (optionally stepped) integer range iterator.
#[derive(Clone, Copy, Debug)]
pub struct ObjRangeIterator {
    /// Next value to yield, if any remain.
    pub current: i64,
    /// Exclusive bound.
    pub limit: i64,
    /// Stride; negative counts down. Never zero.
    pub step: i64,
}

impl ObjRangeIterator {
    /// A fresh iterator starting at `start`.
    pub fn new(start: i64, limit: i64, step: i64) -> Self {
        ObjRangeIterator { current: start, limit, step }
    }

    /// `true` while `current` still satisfies the bound in `step`'s direction.
    pub fn has_next(&self) -> bool {
        if self.step > 0 {
            self.current < self.limit
        } else {
            self.current > self.limit
        }
    }

    /// Yields the current value and advances by `step`, or `None` once exhausted.
    pub fn next(&mut self) -> Option<i64> {
        if !self.has_next() {
            return None;
        }
        let v = self.current;
        self.current += self.step;
        Some(v)
    }
}

/// State of a `for x in array` iterator: the array being walked plus the next
/// index to yield.
#[derive(Clone, Copy, Debug)]
pub struct ObjArrayIterator {
    /// Handle to the array this iterator walks.
    pub array: crate::ObjHandle,
    /// Next index to yield.
    pub index: u32,
}

impl ObjArrayIterator {
    /// A fresh iterator over `array`, starting at index 0.
    pub fn new(array: crate::ObjHandle) -> Self {
        ObjArrayIterator { array, index: 0 }
    }
}

/// Owns every heap-object arena. A `Value`'s `ObjHandle` is only meaningful
/// relative to the `Heap` it was allocated from.
#[derive(Default)]
pub struct Heap {
    /// Arrays (and enum payloads).
    pub arrays: GenArena<ObjArray>,
    /// Enum instances.
    pub enums: GenArena<ObjEnumInstance>,
    /// Errors.
    pub errors: GenArena<ObjError>,
    /// Upvalues.
    pub upvalues: GenArena<ObjUpvalue>,
    /// Closures.
    pub closures: GenArena<ObjClosure>,
    /// Files.
    pub files: GenArena<ObjFile>,
    /// Range iterators.
    pub range_iterators: GenArena<ObjRangeIterator>,
    /// Array iterators.
    pub array_iterators: GenArena<ObjArrayIterator>,
}

impl Heap {
    /// An empty heap.
    pub fn new() -> Self {
        Heap::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn array_push_pop_roundtrip() {
        let mut a = ObjArray::new();
        a.push(Value::I32(1));
        a.push(Value::I32(2));
        assert_eq!(a.len(), 2);
        match a.pop() {
            Some(Value::I32(2)) => {}
            other => panic!("expected Some(I32(2)), got {other:?}"),
        }
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn upvalue_close_transitions_state() {
        let mut uv = ObjUpvalue::open(4);
        assert!(uv.is_open());
        uv.close(Value::I32(9));
        assert!(!uv.is_open());
        match uv.state {
            UpvalueState::Closed(Value::I32(9)) => {}
            _ => panic!("expected closed value"),
        }
    }
}
