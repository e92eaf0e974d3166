//! Orus Compiler — front/middle/back pipeline producing register-VM bytecode.
//!
//! - Entry: `orus_ast::Program`, already typed and optimized by an earlier pass.
//! - Output: a [`codegen::CompileUnit`] — one shared [`orus_bytecode::Chunk`]
//!   plus every [`orus_bytecode::Function`] compiled from it.
//! - Diagnostics: [`error::CompileError`], tagged with the source line that
//!   raised them.
//! - [`module::ModuleManager`] threads export/import resolution across a
//!   whole multi-module compilation run.
//!
//! ```ignore
//! use orus_compiler::{compile_module, module::ModuleManager};
//!
//! let mut manager = ModuleManager::new();
//! let unit = compile_module("main", &mut program, &mut manager)?;
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{
    string::{String, ToString},
    vec::Vec,
};

#[cfg(not(feature = "std"))]
use alloc::{
    string::{String, ToString},
    vec::Vec,
};

use orus_ast::Program;

pub mod codegen;
pub mod error;
pub mod module;
pub mod register;

pub use codegen::{CompileUnit, Compiler};
pub use error::{CompileError, CompileResult};
pub use module::{ExportEntry, ExportKind, ImportEntry, ModuleManager, ModuleRecord};

/// Compiles `program` as the module named `module_name`, registering its
/// exports with `module_manager` for later modules to resolve against.
pub fn compile_module(
    module_name: impl Into<String>,
    program: &mut Program,
    module_manager: &mut ModuleManager,
) -> CompileResult<CompileUnit> {
    let module_name = module_name.into();
    #[cfg(feature = "tracing")]
    tracing::debug!(module = %module_name, items = program.items.len(), "compiling module");
    Compiler::new(module_name).compile(program, module_manager)
}

/// Same as [`compile_module`], but lets the caller skip the optimizer pass
/// registry (`run_optimizer = false`).
pub fn compile_module_with(
    module_name: impl Into<String>,
    program: &mut Program,
    module_manager: &mut ModuleManager,
    run_optimizer: bool,
) -> CompileResult<CompileUnit> {
    let compiler = Compiler::new(module_name);
    let compiler = if run_optimizer { compiler } else { compiler.without_optimizer() };
    compiler.compile(program, module_manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use orus_ast::{Item, Span};

    #[test]
    fn compiling_an_empty_program_registers_no_exports() {
        let mut program = Program { items: Vec::new() };
        let mut manager = ModuleManager::new();
        let unit = compile_module("main", &mut program, &mut manager).unwrap();
        assert_eq!(unit.functions.last().unwrap().name, "<module>");
        assert!(manager.find_module("main").unwrap().exports.is_empty());
    }

    #[test]
    fn two_modules_compile_against_a_shared_manager() {
        let mut lib = Program {
            items: vec![Item::Const(orus_ast::ConstDecl {
                name: "version".to_string(),
                ty: orus_ast::Type::I32,
                value: orus_ast::Expr::Literal(orus_ast::Literal::I32(1)),
                span: Span::new(1, 1, 0),
            })],
        };
        let mut manager = ModuleManager::new();
        compile_module("lib", &mut lib, &mut manager).unwrap();

        let mut main = Program {
            items: vec![Item::Use(orus_ast::UseDecl {
                module: vec!["lib".to_string()],
                names: vec!["version".to_string()],
                span: Span::new(1, 1, 0),
            })],
        };
        let unit = compile_module("main", &mut main, &mut manager).unwrap();
        assert!(unit.chunk.buffer.count() >= 0);
    }
}
