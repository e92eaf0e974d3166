//! Diagnostics raised while resolving, compiling, or linking modules.

use orus_compiler::CompileError;

use crate::search::SearchRoot;

/// One search root the resolver tried, kept for the `NotFound` diagnostic's
/// listing.
#[derive(Clone, Debug)]
pub struct TriedRoot {
    /// The absolute path that was checked.
    pub path: String,
    /// What kind of root this was (importer directory, platform fallback, ...).
    pub kind: &'static str,
}

impl From<&SearchRoot> for TriedRoot {
    fn from(root: &SearchRoot) -> Self {
        TriedRoot { path: root.path.display().to_string(), kind: root.kind.label() }
    }
}

/// A module resolution, compilation, or link failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResolveError {
    /// No search root contained the normalized path.
    #[error("module '{requested}' not found; tried {}", format_tried(roots_tried))]
    NotFound {
        /// The module name as written in the `use`/`interpret_module` call.
        requested: String,
        /// Every root checked, in search order.
        roots_tried: Vec<TriedRoot>,
    },
    /// The module being compiled is already on the loading stack: a `use`
    /// cycle.
    #[error("module '{module}' forms an import cycle: {}", chain.join(" -> "))]
    Cycle {
        /// The module that would re-enter compilation.
        module: String,
        /// The loading stack at the point the cycle was detected.
        chain: Vec<String>,
    },
    /// The file backing a resolved module could not be read.
    #[error("error reading module '{module}' from '{path}': {message}")]
    Io {
        /// The module's normalized name.
        module: String,
        /// The path that failed to read.
        path: String,
        /// The underlying `io::Error`'s message.
        message: String,
    },
    /// The external lexer/parser collaborator rejected the module's source.
    #[error("parse error in module '{module}': {message}")]
    Parse {
        /// The module that failed to parse.
        module: String,
        /// The parser's diagnostic.
        message: String,
    },
    /// Codegen rejected the module.
    #[error("module '{module}': {source}")]
    Compile {
        /// The module being compiled.
        module: String,
        /// The underlying compile failure.
        #[source]
        source: CompileError,
    },
    /// Running a module's top-level raised an error the host never caught.
    #[error("module '{module}': {source}")]
    Runtime {
        /// The module whose init raised.
        module: String,
        /// The underlying runtime failure.
        #[source]
        source: orus_vm::RuntimeError,
    },
}

fn format_tried(roots: &[TriedRoot]) -> String {
    roots.iter().map(|r| format!("{} ({})", r.path, r.kind)).collect::<Vec<_>>().join(", ")
}

/// Convenience alias used throughout this crate.
pub type ResolveResult<T> = Result<T, ResolveError>;
