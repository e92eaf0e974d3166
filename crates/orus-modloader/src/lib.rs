//! orus-modloader — the module resolver (C10): path normalization, search
//! roots, a compile cache, cycle detection, and the cross-module value copy
//! that wires an importer's bound registers to the values its dependencies'
//! top-levels computed.
//!
//! The lexer/parser producing [`orus_ast::Program`] from source text is an
//! external collaborator (see `spec.md` §1's scope note), so [`ModuleLoader`]
//! is built over a caller-supplied parse callback rather than owning one.
//! `orus-host` is the intended caller: it wires a real parser in and drives
//! [`ModuleLoader::compile_entry`]/[`ModuleLoader::link_and_run`] from its
//! `interpret`/`interpret_module` entry points.

#![deny(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use orus_ast::{Item, Program};
use orus_compiler::{compile_module_with, CompileUnit, ModuleManager};
use orus_vm::{LoadedModule, ModuleInstance, Vm};

pub mod error;
pub mod search;

pub use error::{ResolveError, ResolveResult, TriedRoot};
pub use search::{normalize_module_name, oruspath_from_env, search_roots, search_roots_with, RootKind, SearchRoot};

/// Parses one module's source into a [`Program`]. The second argument is the
/// module's dotted name, for parsers that want it in diagnostics.
pub type ParseFn<'p> = dyn Fn(&str, &str) -> Result<Program, String> + 'p;

/// Resolves, compiles, and caches every module a compilation run touches,
/// recursively following `use` declarations in dependency order.
pub struct ModuleLoader<'p> {
    parser: &'p ParseFn<'p>,
    manager: ModuleManager,
    units: BTreeMap<String, Rc<CompileUnit>>,
    by_path: BTreeMap<PathBuf, String>,
    order: Vec<String>,
    loading: Vec<String>,
    oruspath: Option<Vec<PathBuf>>,
    run_optimizer: bool,
}

impl<'p> ModuleLoader<'p> {
    /// A fresh loader backed by `parser`, the lexer/parser collaborator this
    /// crate never implements itself. `ORUSPATH` is read fresh from the
    /// environment on every resolution; use [`Self::with_oruspath`] to pin it
    /// once instead.
    pub fn new(parser: &'p ParseFn<'p>) -> Self {
        ModuleLoader {
            parser,
            manager: ModuleManager::new(),
            units: BTreeMap::new(),
            by_path: BTreeMap::new(),
            order: Vec::new(),
            loading: Vec::new(),
            oruspath: None,
            run_optimizer: true,
        }
    }

    /// Pins the `ORUSPATH` search entries to `roots` for the lifetime of this
    /// loader, instead of re-reading the environment variable on every
    /// resolution. Hosts that read `ORUSPATH` once at startup use this to
    /// keep "the same name from the same importer resolves to the same path
    /// across a run" true even if the environment changes mid-run.
    #[must_use]
    pub fn with_oruspath(mut self, roots: Vec<PathBuf>) -> Self {
        self.oruspath = Some(roots);
        self
    }

    /// Disables the optimizer pass registry for every module this loader
    /// compiles from here on.
    #[must_use]
    pub fn with_run_optimizer(mut self, run_optimizer: bool) -> Self {
        self.run_optimizer = run_optimizer;
        self
    }

    /// The shared export/import table every compiled module registered
    /// against.
    pub fn module_manager(&self) -> &ModuleManager {
        &self.manager
    }

    /// Every module compiled so far, in dependency-first order: replaying
    /// this order and instantiating each one guarantees an importer never
    /// runs before what it imports from.
    pub fn compiled_order(&self) -> &[String] {
        &self.order
    }

    /// The compiled unit for an already-resolved module name.
    pub fn unit(&self, module_name: &str) -> Option<&Rc<CompileUnit>> {
        self.units.get(module_name)
    }

    /// Compiles `source` as the entry module `module_name`, with no backing
    /// file (REPL input, or a host handed a source string directly).
    /// Recursively resolves and compiles every module it `use`s.
    pub fn compile_entry(&mut self, module_name: &str, source: &str) -> ResolveResult<String> {
        self.compile_with_deps(module_name, source, "<repl>", None)
    }

    /// Compiles `source`, already read from `file_path`, as the entry
    /// module `module_name`: nested `use`s resolve relative to
    /// `file_path`'s directory, and the file itself seeds the compile cache
    /// so a later `use` of the same path is a cache hit rather than a
    /// second compile.
    pub fn compile_file(&mut self, module_name: &str, source: &str, file_path: &str) -> ResolveResult<String> {
        self.compile_with_deps(module_name, source, file_path, Some(PathBuf::from(file_path)))
    }

    /// Resolves `requested` against the search roots implied by
    /// `importer_path`, compiling it (and everything it in turn imports) if
    /// it hasn't been compiled yet. Returns the module's canonical dotted
    /// name, ready to look up via [`Self::unit`]/[`Self::module_manager`].
    pub fn resolve_and_compile(&mut self, importer_path: &str, requested: &str) -> ResolveResult<String> {
        if self.units.contains_key(requested) {
            return Ok(requested.to_string());
        }
        if self.loading.iter().any(|m| m == requested) {
            let mut chain = self.loading.clone();
            chain.push(requested.to_string());
            tracing::warn!(module = requested, chain = ?chain, "import cycle");
            return Err(ResolveError::Cycle { module: requested.to_string(), chain });
        }

        let relative = normalize_module_name(requested);
        let roots = match &self.oruspath {
            Some(pinned) => search_roots_with(importer_path, pinned),
            None => search_roots(importer_path),
        };
        let mut tried = Vec::new();
        let mut found = None;
        for root in &roots {
            let candidate = root.path.join(&relative);
            if candidate.is_file() {
                found = Some(candidate);
                break;
            }
            tried.push(TriedRoot::from(root));
        }
        let path = found
            .ok_or_else(|| ResolveError::NotFound { requested: requested.to_string(), roots_tried: tried })?;

        if let Some(existing) = self.by_path.get(&path) {
            return Ok(existing.clone());
        }

        let source = fs::read_to_string(&path).map_err(|e| ResolveError::Io {
            module: requested.to_string(),
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        tracing::debug!(module = requested, path = %path.display(), "resolved module");
        let importer_for_nested_use = path.to_string_lossy().into_owned();
        self.compile_with_deps(requested, &source, &importer_for_nested_use, Some(path))
    }

    fn compile_with_deps(
        &mut self,
        module_name: &str,
        source: &str,
        own_importer_path: &str,
        canonical_path: Option<PathBuf>,
    ) -> ResolveResult<String> {
        self.loading.push(module_name.to_string());

        let mut program = (self.parser)(source, module_name)
            .map_err(|message| ResolveError::Parse { module: module_name.to_string(), message })?;

        for item in &program.items {
            if let Item::Use(use_decl) = item {
                let dotted = use_decl.module.join(".");
                self.resolve_and_compile(own_importer_path, &dotted)?;
            }
        }

        let unit = compile_module_with(module_name, &mut program, &mut self.manager, self.run_optimizer)
            .map_err(|source| ResolveError::Compile { module: module_name.to_string(), source })?;

        self.loading.pop();
        self.units.insert(module_name.to_string(), Rc::new(unit));
        self.order.push(module_name.to_string());
        if let Some(path) = canonical_path {
            self.by_path.insert(path, module_name.to_string());
        }
        Ok(module_name.to_string())
    }

    /// Instantiates and runs every compiled module's top-level, in the order
    /// [`Self::compiled_order`] records. Before a module's top-level runs,
    /// every binding it `use`d is copied out of the exporting module's
    /// (already-run) top-level frame and into this module's bound register —
    /// the cross-module value copy Open Question decision 4 defers to this
    /// component, since a bytecode register operand can only ever address
    /// its own activation's frame.
    pub fn link_and_run(&self, vm: &mut Vm) -> ResolveResult<()> {
        let mut instances: BTreeMap<String, ModuleInstance> = BTreeMap::new();

        for name in &self.order {
            let unit = self.units.get(name).expect("compiled_order only lists compiled modules");
            let loaded = LoadedModule {
                chunk: unit.chunk.clone(),
                functions: unit.functions.clone(),
                module_function_index: unit.module_function_index,
                function_base: 0,
            };
            let inst = vm.instantiate_module(loaded);

            if let Some(record) = self.manager.find_module(name) {
                for import in &record.imports {
                    let (Some(src_inst), Some(src_record)) =
                        (instances.get(&import.source_module), self.manager.find_module(&import.source_module))
                    else {
                        continue;
                    };
                    let Some(export) = src_record.exports.iter().find(|e| e.name == import.symbol) else {
                        continue;
                    };
                    let value = vm.read_register(src_inst.base + u32::from(export.register)).clone();
                    vm.write_register(inst.base + u32::from(import.register), value);
                }
            }

            vm.run_module_init(&inst)
                .map_err(|source| ResolveError::Runtime { module: name.clone(), source })?;
            instances.insert(name.clone(), inst);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use orus_ast::Span;

    fn empty_program(_source: &str, _name: &str) -> Result<Program, String> {
        Ok(Program { items: Vec::new() })
    }

    #[test]
    fn compiling_entry_source_with_no_imports_registers_the_module() {
        let parser: &ParseFn = &empty_program;
        let mut loader = ModuleLoader::new(parser);
        let name = loader.compile_entry("main", "").unwrap();
        assert_eq!(name, "main");
        assert_eq!(loader.compiled_order(), &["main".to_string()]);
    }

    #[test]
    fn resolving_a_missing_module_reports_every_root_tried() {
        fn parser(_source: &str, _name: &str) -> Result<Program, String> {
            Ok(Program { items: Vec::new() })
        }
        let parse_fn: &ParseFn = &parser;
        let mut loader = ModuleLoader::new(parse_fn);
        let err = loader.resolve_and_compile("<repl>", "does.not.exist").unwrap_err();
        match err {
            ResolveError::NotFound { requested, roots_tried } => {
                assert_eq!(requested, "does.not.exist");
                assert!(!roots_tried.is_empty());
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn a_self_importing_module_is_a_cycle() {
        fn parser(_source: &str, name: &str) -> Result<Program, String> {
            if name == "a" {
                Ok(Program {
                    items: vec![Item::Use(orus_ast::UseDecl {
                        module: vec!["a".to_string()],
                        names: vec!["x".to_string()],
                        span: Span::new(1, 1, 0),
                    })],
                })
            } else {
                Ok(Program { items: Vec::new() })
            }
        }
        let parse_fn: &ParseFn = &parser;
        let mut loader = ModuleLoader::new(parse_fn);
        // "a" resolves against its own name as a bare (std-style) path; since
        // no such file exists on disk the cycle never gets a chance to form
        // through resolve_and_compile's filesystem lookup, so drive the cycle
        // check directly through compile_with_deps instead.
        loader.loading.push("a".to_string());
        let err = loader.resolve_and_compile("<repl>", "a").unwrap_err();
        assert!(matches!(err, ResolveError::Cycle { .. }));
    }

    #[test]
    fn a_pinned_oruspath_entry_resolves_a_module_without_reading_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("std")).unwrap();
        std::fs::write(dir.path().join("std/greet.orus"), "").unwrap();

        let parser: &ParseFn = &empty_program;
        let mut loader = ModuleLoader::new(parser).with_oruspath(vec![dir.path().to_path_buf()]);
        let name = loader.resolve_and_compile("<repl>", "greet").unwrap();
        assert_eq!(name, "greet");
    }
}
