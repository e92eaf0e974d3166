//! orus-host — the embedding facade: `Vm::new`, `Vm::interpret`,
//! `Vm::interpret_module`, mirroring the conceptual `vm_init()`/`vm_free()`/
//! `interpret(source)`/`interpret_module(path, module_name_hint)` host API.
//!
//! This is the one crate in the workspace allowed to install a `tracing`
//! subscriber (behind the `tracing-subscriber` feature) and the one crate
//! that owns a real lexer/parser, handed to [`orus_modloader::ModuleLoader`]
//! as its [`orus_modloader::ParseFn`] collaborator. Library crates below
//! this one never initialize global state and never parse source text
//! themselves.

#![deny(missing_docs)]

use std::fs;
use std::path::Path;

use orus_modloader::{ModuleLoader, ParseFn, ResolveError};
use orus_natives::NativeRegistry;
use orus_vm::Vm as CoreVm;

pub use orus_core::Value;

pub mod config;

pub use config::VmConfig;

#[cfg(feature = "tracing-subscriber")]
pub mod subscriber;

/// Re-exported under a host-facing name: the same diagnostic every
/// `interpret`/`interpret_module` call can fail with.
pub type HostError = ResolveError;

/// What one `interpret`/`interpret_module` call produced. `spec.md`'s
/// conceptual host API returns `Ok`, `CompileError`, or `RuntimeError`;
/// [`HostError`]'s `Compile`/`Runtime` variants (plus `Parse`/`Io`/
/// `NotFound`/`Cycle` for module resolution) cover that tri-state and more.
#[derive(Clone, Debug)]
pub enum InterpretOutcome {
    /// Every module resolved, compiled, and ran its top-level with nothing
    /// left unhandled.
    Completed,
    /// Resolution, compilation, or a module top-level run failed.
    Failed(HostError),
}

impl InterpretOutcome {
    /// `true` for [`InterpretOutcome::Completed`].
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, InterpretOutcome::Completed)
    }

    /// The failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&HostError> {
        match self {
            InterpretOutcome::Completed => None,
            InterpretOutcome::Failed(e) => Some(e),
        }
    }
}

/// One embedding session: a register-machine [`orus_vm::Vm`] plus the module
/// loader driving source through it. `'p` is the lifetime of the
/// caller-supplied parser (lexing/parsing the AST is an external
/// collaborator this crate never implements).
pub struct Vm<'p> {
    config: VmConfig,
    core: CoreVm,
    parser: &'p ParseFn<'p>,
    last_error: Option<HostError>,
    next_repl_id: u32,
}

impl<'p> Vm<'p> {
    /// A fresh session backed by `config` and `parser`. The core VM starts
    /// with the default native registry (`io`/`math`/`time`/`os`) and
    /// `config.frames_max` as its call-stack depth limit.
    pub fn new(config: VmConfig, parser: &'p ParseFn<'p>) -> Self {
        let core = CoreVm::with_natives(NativeRegistry::with_defaults()).with_frames_max(config.frames_max);
        Vm { config, core, parser, last_error: None, next_repl_id: 0 }
    }

    /// Direct access to the underlying register machine, for a host seeding
    /// `env` bindings or inspecting heap state after interpretation.
    pub fn core_vm_mut(&mut self) -> &mut CoreVm {
        &mut self.core
    }

    /// The error left behind by the most recent `interpret`/
    /// `interpret_module` call, or `None` if it completed or this is a fresh
    /// session. Cleared at the start of the next call, per `spec.md` §6's
    /// "logged once and then cleared on the next interpretation".
    pub fn last_error(&self) -> Option<&HostError> {
        self.last_error.as_ref()
    }

    /// Interprets `source` as a one-off entry module, defaulting its
    /// location to `"<repl>"` the way REPL input or a bare source string
    /// has no backing file. Every module it transitively `use`s is resolved
    /// against this session's [`VmConfig`].
    pub fn interpret(&mut self, source: &str) -> InterpretOutcome {
        self.last_error = None;
        let module_name = format!("<repl:{}>", self.next_repl_id);
        self.next_repl_id += 1;
        let mut loader = self.fresh_loader();
        let outcome = loader
            .compile_entry(&module_name, source)
            .and_then(|_| loader.link_and_run(&mut self.core));
        self.finish(outcome)
    }

    /// Interprets the file at `path` as a module named `module_name_hint`,
    /// with nested `use`s resolving relative to `path`'s own directory.
    pub fn interpret_module(&mut self, path: &Path, module_name_hint: &str) -> InterpretOutcome {
        self.last_error = None;
        let source = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                return self.finish(Err(ResolveError::Io {
                    module: module_name_hint.to_string(),
                    path: path.display().to_string(),
                    message: e.to_string(),
                }));
            }
        };
        let file_path = path.to_string_lossy().into_owned();
        let mut loader = self.fresh_loader();
        let outcome = loader
            .compile_file(module_name_hint, &source, &file_path)
            .and_then(|_| loader.link_and_run(&mut self.core));
        self.finish(outcome)
    }

    fn fresh_loader(&self) -> ModuleLoader<'p> {
        ModuleLoader::new(self.parser)
            .with_oruspath(self.config.oruspath.clone())
            .with_run_optimizer(self.config.run_optimizer)
    }

    fn finish(&mut self, result: Result<(), ResolveError>) -> InterpretOutcome {
        match result {
            Ok(()) => InterpretOutcome::Completed,
            Err(e) => {
                tracing::warn!(error = %e, "interpretation failed");
                self.last_error = Some(e.clone());
                InterpretOutcome::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orus_ast::Program;

    fn empty_program(_source: &str, _name: &str) -> Result<Program, String> {
        Ok(Program { items: Vec::new() })
    }

    #[test]
    fn interpreting_an_empty_program_completes() {
        let parser: &ParseFn = &empty_program;
        let mut vm = Vm::new(VmConfig::default(), parser);
        let outcome = vm.interpret("");
        assert!(outcome.is_completed());
        assert!(vm.last_error().is_none());
    }

    #[test]
    fn a_missing_module_file_is_reported_and_then_cleared() {
        let parser: &ParseFn = &empty_program;
        let mut vm = Vm::new(VmConfig::default(), parser);
        let outcome = vm.interpret_module(Path::new("/does/not/exist.orus"), "main");
        assert!(matches!(outcome, InterpretOutcome::Failed(ResolveError::Io { .. })));
        assert!(vm.last_error().is_some());

        let second = vm.interpret("");
        assert!(second.is_completed());
        assert!(vm.last_error().is_none());
    }
}
