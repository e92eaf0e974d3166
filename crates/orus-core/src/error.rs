//! Value-level error taxonomy: the mismatches the object model itself can
//! detect (wrong accessor for the current tag, out-of-bounds array access).
//! The broader Type/Value/Name/Import/Runtime/Syntax/Feature/Redefinition
//! taxonomy (spec §7) is realized by the compiler/VM crates, which wrap
//! these into their own domain errors.

use core::fmt;

#[cfg(feature = "std")]
use thiserror::Error;

/// Errors raised by `Value`/object-model accessors and rope operations.
#[cfg_attr(feature = "std", derive(Error))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// An `AS_T` accessor was called on a value whose tag didn't match.
    #[cfg_attr(feature = "std", error("type mismatch: expected {expected}, found {found}"))]
    TypeMismatch {
        /// The tag the caller expected.
        expected: &'static str,
        /// The tag the value actually carried.
        found: &'static str,
    },
    /// An array index fell outside `[0, len)`.
    #[cfg_attr(feature = "std", error("array index {index} out of bounds (len {len})"))]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// The array's length at the time of access.
        len: usize,
    },
}

#[cfg(not(feature = "std"))]
impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            ValueError::IndexOutOfBounds { index, len } => {
                write!(f, "array index {index} out of bounds (len {len})")
            }
        }
    }
}

/// Result alias for object-model operations.
pub type ValueResult<T> = core::result::Result<T, ValueError>;
