//! Diagnostics `orus-compiler` itself can raise, layered over the lower
//! crates' own error types rather than duplicating their taxonomies.

#[cfg(feature = "std")]
use std::string::String;

#[cfg(not(feature = "std"))]
use alloc::string::String;

use orus_bytecode::ChunkError;
use orus_symbols::SymbolError;

/// A compile-time failure, tagged with the source line it was raised at.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum CompileError {
    /// E1011 / E1xxx name-resolution failures, forwarded from the symbol table.
    #[cfg_attr(feature = "std", error("line {line}: {source}"))]
    Name {
        /// The underlying resolution failure.
        source: SymbolError,
        /// Source line of the reference that failed.
        line: u32,
    },
    /// E3003: `use` named a module that was never registered with the module
    /// manager before this compile ran.
    #[cfg_attr(feature = "std", error("line {line}: module '{module}' not found"))]
    ModuleNotFound {
        /// The dotted module path as written.
        module: String,
        /// Source line of the `use`.
        line: u32,
    },
    /// E3004: `use` named a symbol the target module never exports.
    #[cfg_attr(
        feature = "std",
        error("line {line}: module '{module}' does not export '{symbol}'")
    )]
    ExportNotFound {
        /// The dotted module path as written.
        module: String,
        /// The symbol that was asked for.
        symbol: String,
        /// Source line of the `use`.
        line: u32,
    },
    /// A module tried to export the same name twice.
    #[cfg_attr(
        feature = "std",
        error("line {line}: '{name}' is already exported from this module")
    )]
    DuplicateExport {
        /// The repeated export name.
        name: String,
        /// Source line of the second declaration.
        line: u32,
    },
    /// E1401: `break` outside any enclosing loop, or naming an unknown label.
    #[cfg_attr(feature = "std", error("line {line}: break outside of a loop"))]
    BreakOutsideLoop {
        /// Source line of the `break`.
        line: u32,
    },
    /// E1402: `continue` outside any enclosing loop, or naming an unknown label.
    #[cfg_attr(feature = "std", error("line {line}: continue outside of a loop"))]
    ContinueOutsideLoop {
        /// Source line of the `continue`.
        line: u32,
    },
    /// A `base.field` or `Name { field: .. }` expression referenced a field no
    /// declared struct carries under that name.
    #[cfg_attr(
        feature = "std",
        error("line {line}: '{struct_name}' has no field '{field}'")
    )]
    UnknownField {
        /// The struct type name, if known, or the placeholder used when the
        /// base expression's type could not be determined locally.
        struct_name: String,
        /// The field name that didn't resolve.
        field: String,
        /// Source line of the reference.
        line: u32,
    },
    /// `Name { .. }` or `Name::Variant(..)` named a type never declared.
    #[cfg_attr(feature = "std", error("line {line}: unknown type '{name}'"))]
    UnknownType {
        /// The undeclared type name.
        name: String,
        /// Source line of the reference.
        line: u32,
    },
    /// The bytecode buffer rejected an emission (jump offset overflow, or an
    /// internal misuse of a non-jump opcode as a placeholder).
    #[cfg_attr(feature = "std", error("line {line}: {source}"))]
    Emission {
        /// The underlying buffer failure.
        source: ChunkError,
        /// Source line active when the failure occurred.
        line: u32,
    },
    /// Ran out of register indices in one function's own register file.
    #[cfg_attr(feature = "std", error("line {line}: function ran out of registers"))]
    RegistersExhausted {
        /// Source line active when the allocation failed.
        line: u32,
    },
    /// Any other diagnostic not worth its own variant.
    #[cfg_attr(feature = "std", error("line {line}: {message}"))]
    Message {
        /// Free-form description.
        message: String,
        /// Source line active when it was raised.
        line: u32,
    },
}

#[cfg(not(feature = "std"))]
impl core::fmt::Display for CompileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CompileError::Name { source, line } => write!(f, "line {line}: {source}"),
            CompileError::ModuleNotFound { module, line } => {
                write!(f, "line {line}: module '{module}' not found")
            }
            CompileError::ExportNotFound { module, symbol, line } => {
                write!(f, "line {line}: module '{module}' does not export '{symbol}'")
            }
            CompileError::DuplicateExport { name, line } => {
                write!(f, "line {line}: '{name}' is already exported from this module")
            }
            CompileError::BreakOutsideLoop { line } => write!(f, "line {line}: break outside of a loop"),
            CompileError::ContinueOutsideLoop { line } => {
                write!(f, "line {line}: continue outside of a loop")
            }
            CompileError::UnknownField { struct_name, field, line } => {
                write!(f, "line {line}: '{struct_name}' has no field '{field}'")
            }
            CompileError::UnknownType { name, line } => write!(f, "line {line}: unknown type '{name}'"),
            CompileError::Emission { source, line } => write!(f, "line {line}: {source}"),
            CompileError::RegistersExhausted { line } => {
                write!(f, "line {line}: function ran out of registers")
            }
            CompileError::Message { message, line } => write!(f, "line {line}: {message}"),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type CompileResult<T> = core::result::Result<T, CompileError>;
