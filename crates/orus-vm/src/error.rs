//! Diagnostics `orus-vm` itself raises, layered over `orus_core`'s own
//! value-model taxonomy rather than duplicating it.

#[cfg(feature = "std")]
use std::string::String;

#[cfg(not(feature = "std"))]
use alloc::string::String;

use orus_bytecode::ChunkError;
use orus_core::{ErrorKind, ValueError};

/// A runtime failure, carrying the taxonomy kind `raise`/`catch` expose to
/// user code plus a message. Distinct from a bare Rust panic, which remains
/// reserved for internal invariant violations the compiler should never have
/// let through (an out-of-range register index, an unknown opcode byte).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "errors", derive(thiserror::Error))]
pub enum RuntimeError {
    /// A value-model accessor mismatch surfaced during dispatch (wrong tag
    /// for an arithmetic/comparison operand, bad array index).
    #[cfg_attr(feature = "errors", error("{kind}: {source}"))]
    Value {
        /// Taxonomy kind to report to user code via `catch`.
        kind: ErrorKind,
        /// The underlying value-model mismatch.
        source: ValueError,
    },
    /// An operand's tag didn't match what the opcode required (e.g.
    /// `OP_JUMP_IF_NOT_R` on a non-bool register).
    #[cfg_attr(feature = "errors", error("TypeError: expected {expected}, found {found}"))]
    Type {
        /// What the opcode required.
        expected: &'static str,
        /// What tag the operand actually carried.
        found: &'static str,
    },
    /// Arithmetic overflowed past the widest type the opcode supports (i64),
    /// or an increment overflowed a fused-loop counter.
    #[cfg_attr(feature = "errors", error("ValueError: {0}"))]
    Overflow(String),
    /// Division or modulo by zero.
    #[cfg_attr(feature = "errors", error("ValueError: division by zero"))]
    DivideByZero,
    /// A struct/array index fell outside the target's bounds.
    #[cfg_attr(feature = "errors", error("ValueError: index {index} out of bounds (len {len})"))]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// The target's length at the time of access.
        len: usize,
    },
    /// `OP_CALL_R`'s `func_reg` didn't hold a `Function`/`Closure` value.
    #[cfg_attr(feature = "errors", error("TypeError: value is not callable"))]
    NotCallable,
    /// A call supplied the wrong number of arguments for the callee's arity.
    #[cfg_attr(feature = "errors", error("ValueError: expected {expected} arguments, got {got}"))]
    Arity {
        /// The callee's declared arity.
        expected: u32,
        /// The argument count the call site actually supplied.
        got: usize,
    },
    /// Call-frame depth exceeded the configured `FRAMES_MAX`.
    #[cfg_attr(feature = "errors", error("RuntimeError: stack overflow"))]
    StackOverflow,
    /// `raise` ran with no active `try`/`catch` to unwind to, or the VM's
    /// entry point was asked to surface an error it could not defer.
    #[cfg_attr(feature = "errors", error("{kind}: {message}"))]
    Unhandled {
        /// Taxonomy kind of the original error.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// The native registry rejected a call: unknown fully-qualified name, or
    /// an arity mismatch it caught itself.
    #[cfg_attr(feature = "errors", error("RuntimeError: native call failed: {0}"))]
    Native(String),
    /// The decoded opcode byte isn't one of the 52 valid variants, or a jump
    /// target fell outside the chunk — both indicate a corrupt or
    /// hand-assembled chunk, never something the compiler itself emits.
    #[cfg_attr(feature = "errors", error("RuntimeError: {0}"))]
    Corrupt(#[cfg_attr(feature = "errors", from)] ChunkError),
    /// Internal sentinel: a raise found a `try`/`catch` handler and the call
    /// stack/ip have already been rewound to it. Never surfaced to a host;
    /// `Vm::run`'s loop catches this and resumes dispatch instead of
    /// propagating it, which is why every fallible dispatch helper can use
    /// `?` to unwind out of the current opcode the instant a raise occurs,
    /// whether or not it ends up caught.
    #[cfg_attr(feature = "errors", error("internal: exception handled"))]
    Handled,
}

#[cfg(not(feature = "errors"))]
impl core::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RuntimeError::Value { kind, source } => write!(f, "{kind}: {source}"),
            RuntimeError::Type { expected, found } => {
                write!(f, "TypeError: expected {expected}, found {found}")
            }
            RuntimeError::Overflow(msg) => write!(f, "ValueError: {msg}"),
            RuntimeError::DivideByZero => write!(f, "ValueError: division by zero"),
            RuntimeError::IndexOutOfBounds { index, len } => {
                write!(f, "ValueError: index {index} out of bounds (len {len})")
            }
            RuntimeError::NotCallable => write!(f, "TypeError: value is not callable"),
            RuntimeError::Arity { expected, got } => {
                write!(f, "ValueError: expected {expected} arguments, got {got}")
            }
            RuntimeError::StackOverflow => write!(f, "RuntimeError: stack overflow"),
            RuntimeError::Unhandled { kind, message } => write!(f, "{kind}: {message}"),
            RuntimeError::Native(msg) => write!(f, "RuntimeError: native call failed: {msg}"),
            RuntimeError::Corrupt(e) => write!(f, "RuntimeError: {e}"),
            RuntimeError::Handled => write!(f, "internal: exception handled"),
        }
    }
}

#[cfg(not(feature = "errors"))]
impl From<ChunkError> for RuntimeError {
    fn from(e: ChunkError) -> Self {
        RuntimeError::Corrupt(e)
    }
}

impl RuntimeError {
    /// The taxonomy kind `raise`/`catch` surface for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Value { kind, .. } => *kind,
            RuntimeError::Type { .. } | RuntimeError::NotCallable => ErrorKind::Type,
            RuntimeError::Overflow(_)
            | RuntimeError::DivideByZero
            | RuntimeError::IndexOutOfBounds { .. }
            | RuntimeError::Arity { .. } => ErrorKind::Value,
            RuntimeError::StackOverflow | RuntimeError::Native(_) | RuntimeError::Corrupt(_) => {
                ErrorKind::Runtime
            }
            RuntimeError::Unhandled { kind, .. } => *kind,
            RuntimeError::Handled => ErrorKind::Runtime,
        }
    }
}

/// Result alias for dispatch-core operations.
pub type VmResult<T> = core::result::Result<T, RuntimeError>;
