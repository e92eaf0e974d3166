//! C5 Module Manager: per-module export/import bookkeeping shared across a
//! whole compilation run, so one module can resolve symbols another module
//! (already compiled earlier in dependency order) exports.

#[cfg(feature = "std")]
use std::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

#[cfg(not(feature = "std"))]
use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

use orus_ast::Type;

use crate::error::{CompileError, CompileResult};

/// What kind of value a module export names.
#[derive(Clone, Debug, PartialEq)]
pub enum ExportKind {
    /// A module-level `let`/`const` binding.
    Global,
    /// A top-level function.
    Function,
    /// A struct type's constructor surface.
    Struct,
    /// An enum type's constructor surface.
    Enum,
    /// A function stub the VM binds to a native implementation at load time
    /// (see [`crate::codegen::Compiler`]'s `raise` lowering).
    Intrinsic,
}

/// One exported name.
#[derive(Clone, Debug)]
pub struct ExportEntry {
    /// The exported name.
    pub name: String,
    /// What it names.
    pub kind: ExportKind,
    /// The register it lives in within its owning module's top-level frame.
    pub register: u8,
    /// Its declared type.
    pub ty: Type,
    /// The function table index, for `ExportKind::Function`/`Intrinsic`.
    pub function_index: Option<u32>,
    /// The native registry key the VM patches into the function stub at
    /// load time, for `ExportKind::Intrinsic`.
    pub intrinsic_symbol: Option<String>,
}

/// One `use module::{a, b}` import, recorded for diagnostics and for the
/// module loader's cross-module value copy at load time.
#[derive(Clone, Debug)]
pub struct ImportEntry {
    /// The imported symbol's name.
    pub symbol: String,
    /// The module it was imported from.
    pub source_module: String,
    /// The register this import was bound to in the importing module's
    /// top-level frame; the loader copies the exporting module's value here.
    pub register: u8,
}

/// One module's accumulated exports and imports.
#[derive(Clone, Debug, Default)]
pub struct ModuleRecord {
    /// Exports registered so far, in registration order.
    pub exports: Vec<ExportEntry>,
    /// Imports this module has pulled in, in declaration order.
    pub imports: Vec<ImportEntry>,
}

impl ModuleRecord {
    fn find_export(&self, name: &str) -> Option<&ExportEntry> {
        self.exports.iter().find(|e| e.name == name)
    }
}

/// Tracks every module touched by one compilation run. A module is
/// get-or-created by [`Self::load_module`]; its exports are only visible to
/// other modules once that module has finished compiling successfully and
/// transcribed them via [`Self::register_module_export`].
#[derive(Debug, Default)]
pub struct ModuleManager {
    modules: BTreeMap<String, ModuleRecord>,
}

impl ModuleManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the module's record, creating an empty one if this is the
    /// first time `name` has been seen.
    pub fn load_module(&mut self, name: &str) -> &mut ModuleRecord {
        self.modules.entry(name.to_string()).or_default()
    }

    /// The module's record, if it has been loaded at least once.
    pub fn find_module(&self, name: &str) -> Option<&ModuleRecord> {
        self.modules.get(name)
    }

    /// Records a new export under `module`. Fails if that name is already
    /// exported from this module.
    pub fn register_module_export(
        &mut self,
        module: &str,
        entry: ExportEntry,
        line: u32,
    ) -> CompileResult<()> {
        let record = self.load_module(module);
        if record.find_export(&entry.name).is_some() {
            return Err(CompileError::DuplicateExport { name: entry.name, line });
        }
        record.exports.push(entry);
        Ok(())
    }

    /// Resolves `symbol` against `module_name`'s recorded exports.
    pub fn resolve_export(
        &self,
        module_name: &str,
        symbol: &str,
        line: u32,
    ) -> CompileResult<&ExportEntry> {
        let record = self.find_module(module_name).ok_or_else(|| CompileError::ModuleNotFound {
            module: module_name.to_string(),
            line,
        })?;
        record.find_export(symbol).ok_or_else(|| CompileError::ExportNotFound {
            module: module_name.to_string(),
            symbol: symbol.to_string(),
            line,
        })
    }

    /// Records that `target_module` imported `symbol` from `source_module`
    /// into `register`, after the caller has already confirmed the export
    /// resolves and allocated the binding's register.
    pub fn import_variable(&mut self, target_module: &str, symbol: &str, source_module: &str, register: u8) {
        let record = self.load_module(target_module);
        record.imports.push(ImportEntry {
            symbol: symbol.to_string(),
            source_module: source_module.to_string(),
            register,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(name: &str) -> ExportEntry {
        ExportEntry {
            name: name.to_string(),
            kind: ExportKind::Global,
            register: 0,
            ty: Type::I32,
            function_index: None,
            intrinsic_symbol: None,
        }
    }

    #[test]
    fn resolving_an_unloaded_module_reports_module_not_found() {
        let mgr = ModuleManager::new();
        let err = mgr.resolve_export("math", "pi", 1).unwrap_err();
        assert!(matches!(err, CompileError::ModuleNotFound { .. }));
    }

    #[test]
    fn resolving_a_missing_export_reports_export_not_found() {
        let mut mgr = ModuleManager::new();
        mgr.register_module_export("math", entry("pi"), 1).unwrap();
        let err = mgr.resolve_export("math", "tau", 2).unwrap_err();
        assert!(matches!(err, CompileError::ExportNotFound { .. }));
    }

    #[test]
    fn duplicate_export_names_are_rejected() {
        let mut mgr = ModuleManager::new();
        mgr.register_module_export("math", entry("pi"), 1).unwrap();
        let err = mgr.register_module_export("math", entry("pi"), 5).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateExport { .. }));
    }

    #[test]
    fn a_registered_export_resolves() {
        let mut mgr = ModuleManager::new();
        mgr.register_module_export("math", entry("pi"), 1).unwrap();
        let found = mgr.resolve_export("math", "pi", 2).unwrap();
        assert_eq!(found.register, 0);
    }
}
