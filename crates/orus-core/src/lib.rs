//! orus-core — the Orus value and object model.
//!
//! Houses the tagged [`Value`] union (C1) and the ref-counted, immutable
//! string rope engine (C2) that backs `Value::String`. Heap objects
//! (strings, arrays, enum instances, errors, iterators, closures, upvalues)
//! live in [`orus_mm::GenArena`]s owned by a [`Heap`]; a `Value` never holds
//! a raw pointer, only a handle into the arena that owns its kind.
//!
//! Features:
//! - `std` (default): enables `thiserror`-based `Display`/`Error` impls.
//! - `serde`: derive (de)serialization on `Value` and friends.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{rc::Rc, string::String, string::ToString, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{rc::Rc, string::String, string::ToString, vec::Vec};

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use orus_mm::{djb2_hash, GenArena, Handle};

/// String rope engine: leaf/concat/substring nodes, lazy flattening, intern table.
pub mod rope;
/// Heap object kinds built atop the rope engine: arrays, enums, errors, closures, upvalues.
pub mod objects;
/// Value-level error taxonomy (type/value mismatches surfaced by the object model itself).
pub mod error;

pub use error::{ValueError, ValueResult};
pub use objects::{
    ErrorKind, FileState, Heap, ObjArray, ObjArrayIterator, ObjClosure, ObjEnumInstance, ObjError,
    ObjFile, ObjRangeIterator, ObjUpvalue, SrcLocation, UpvalueState,
};
pub use rope::{ObjString, Rope};

/// A handle into one of the heap's typed arenas, tagged by object kind so a
/// `Value` can carry it without the heap itself being reachable from the tag.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjHandle(pub Handle);

impl From<Handle> for ObjHandle {
    fn from(h: Handle) -> Self {
        ObjHandle(h)
    }
}

/// The tagged dynamic value every register, constant, and field holds.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer, the default integer literal type.
    I32(i32),
    /// 64-bit signed integer, used after widening.
    I64(i64),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 64-bit float.
    F64(f64),
    /// Rope-backed immutable string.
    String(ObjString),
    /// Raw byte buffer.
    Bytes(Rc<Vec<u8>>),
    /// Mutable, reference-identity array.
    Array(ObjHandle),
    /// Enum instance (tagged variant + optional payload array).
    Enum(ObjHandle),
    /// A raised or caught error value.
    Error(ObjHandle),
    /// An iterator over an integer range.
    RangeIterator(ObjHandle),
    /// An iterator over an array's elements.
    ArrayIterator(ObjHandle),
    /// An open file handle.
    File(ObjHandle),
    /// Index into the VM's function table; not itself callable without a closure.
    Function(u32),
    /// A closure over a function plus its captured upvalues.
    Closure(ObjHandle),
}

impl Value {
    /// `true` for mutable-container and iterator variants, which compare by
    /// identity rather than structurally.
    pub fn is_reference_identity(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::RangeIterator(_) | Value::ArrayIterator(_) | Value::File(_)
        )
    }

    /// Tag name, used in type-mismatch diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Enum(_) => "enum",
            Value::Error(_) => "error",
            Value::RangeIterator(_) => "range_iterator",
            Value::ArrayIterator(_) => "array_iterator",
            Value::File(_) => "file",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
        }
    }

    /// `IS_BOOL` etc. predicates, generated by hand for the scalar tags that
    /// dispatch and codegen check most often.
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }
    /// True for `I32`.
    pub fn is_i32(&self) -> bool {
        matches!(self, Value::I32(_))
    }
    /// True for `I64`.
    pub fn is_i64(&self) -> bool {
        matches!(self, Value::I64(_))
    }
    /// True for `F64`.
    pub fn is_f64(&self) -> bool {
        matches!(self, Value::F64(_))
    }
    /// True for `String`.
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// `AS_BOOL`: defined behavior only when `is_bool()` holds.
    pub fn as_bool(&self) -> ValueResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(ValueError::TypeMismatch { expected: "bool", found: other.type_name() }),
        }
    }
    /// `AS_I32`: defined behavior only when `is_i32()` holds.
    pub fn as_i32(&self) -> ValueResult<i32> {
        match self {
            Value::I32(n) => Ok(*n),
            other => Err(ValueError::TypeMismatch { expected: "i32", found: other.type_name() }),
        }
    }
}

impl PartialEq for Value {
    /// Delegates to [`values_equal`] rather than a derived field-wise
    /// comparison: floats compare by bit pattern (so `NaN == NaN` holds for
    /// two values produced the same way) and mutable containers/iterators
    /// compare by arena handle, not by recursively comparing their contents.
    fn eq(&self, other: &Self) -> bool {
        values_equal(self, other)
    }
}

/// Structural equality for scalars/enums/bytes/strings; identity for mutable
/// containers and iterators (compared by arena handle).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::I32(x), Value::I32(y)) => x == y,
        (Value::I64(x), Value::I64(y)) => x == y,
        (Value::U32(x), Value::U32(y)) => x == y,
        (Value::U64(x), Value::U64(y)) => x == y,
        (Value::F64(x), Value::F64(y)) => x.to_bits() == y.to_bits() || x == y,
        (Value::String(x), Value::String(y)) => x.flatten_str() == y.flatten_str(),
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Function(x), Value::Function(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => x.0 == y.0,
        (Value::RangeIterator(x), Value::RangeIterator(y)) => x.0 == y.0,
        (Value::ArrayIterator(x), Value::ArrayIterator(y)) => x.0 == y.0,
        (Value::File(x), Value::File(y)) => x.0 == y.0,
        (Value::Closure(x), Value::Closure(y)) => x.0 == y.0,
        (Value::Enum(x), Value::Enum(y)) => x.0 == y.0,
        (Value::Error(x), Value::Error(y)) => x.0 == y.0,
        _ => false,
    }
}

/// Formats an `f64` per the canonical print rule: NaN/Inf spellings, `%.17f`
/// normally, `%.17g`-equivalent trimming below `1e-4`, trailing zeros and a
/// dangling decimal point stripped.
pub fn format_f64(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if x == 0.0 {
        return "0".to_string();
    }
    let s = if x.abs() < 1e-4 {
        format!("{:.17e}", x)
    } else {
        format!("{:.17}", x)
    };
    match s.split_once('e') {
        Some((mantissa, exponent)) => {
            let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
            format!("{mantissa}e{exponent}")
        }
        None => s.trim_end_matches('0').trim_end_matches('.').to_string(),
    }
}

/// Canonical text form used by the print opcodes. Does not itself append a
/// newline; `OP_PRINT_R` adds one, `OP_PRINT_NO_NL_R` doesn't.
pub fn print_value(heap: &Heap, v: &Value) -> String {
    match v {
        Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
        Value::I32(n) => n.to_string(),
        Value::I64(n) => n.to_string(),
        Value::U32(n) => n.to_string(),
        Value::U64(n) => n.to_string(),
        Value::F64(f) => format_f64(*f),
        Value::String(s) => s.flatten_str(),
        Value::Bytes(b) => format!("{:?}", b.as_slice()),
        Value::Array(h) => heap
            .arrays
            .get(h.0)
            .map(|arr| {
                arr.elements
                    .iter()
                    .map(|e| print_value(heap, e))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default(),
        Value::Enum(h) => heap
            .enums
            .get(h.0)
            .map(|e| {
                let payload = e
                    .payload
                    .as_ref()
                    .map(|p| {
                        heap.arrays
                            .get(p.0)
                            .map(|arr| {
                                arr.elements.iter().map(|v| print_value(heap, v)).collect::<Vec<_>>().join(", ")
                            })
                            .unwrap_or_default()
                    })
                    .map(|s| format!("({s})"))
                    .unwrap_or_default();
                format!("{}.{}{}", e.type_name, e.variant_name, payload)
            })
            .unwrap_or_default(),
        Value::Error(h) => heap
            .errors
            .get(h.0)
            .map(|e| format!("Error: {}", e.message))
            .unwrap_or_default(),
        Value::RangeIterator(_) => "range_iterator(..)".to_string(),
        Value::ArrayIterator(_) => "array_iterator(..)".to_string(),
        Value::File(h) => heap
            .files
            .get(h.0)
            .map(|f| format!("file(path=\"{}\", handle=0x{:X}, {})", f.path, h.0.index(), f.state))
            .unwrap_or_default(),
        Value::Function(idx) => format!("<function #{idx}>"),
        Value::Closure(_) => "<closure>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn structural_equality_for_scalars() {
        assert!(values_equal(&Value::I32(3), &Value::I32(3)));
        assert!(!values_equal(&Value::I32(3), &Value::I64(3)));
    }

    #[test]
    fn f64_print_rule_handles_specials() {
        assert_eq!(format_f64(f64::NAN), "nan");
        assert_eq!(format_f64(f64::INFINITY), "inf");
        assert_eq!(format_f64(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_f64(0.0), "0");
        assert_eq!(format_f64(1.5), "1.5");
    }

    #[test]
    fn array_identity_equality() {
        let mut heap = Heap::new();
        let h1 = heap.arrays.insert(ObjArray::new());
        let h2 = heap.arrays.insert(ObjArray::new());
        let a = Value::Array(ObjHandle(h1));
        let b = Value::Array(ObjHandle(h1));
        let c = Value::Array(ObjHandle(h2));
        assert!(values_equal(&a, &b));
        assert!(!values_equal(&a, &c));
    }

    #[test]
    fn djb2_reexport_is_usable_for_intern_lookups() {
        assert_eq!(djb2_hash(b"abc"), djb2_hash(b"abc"));
    }
}
