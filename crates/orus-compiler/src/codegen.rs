//! C6 Codegen: lowers a typed [`orus_ast::Program`] to a [`CompileUnit`].
//!
//! A module's top-level `const`/`fn` declarations compile into one synthetic
//! `"<module>"` function; its register file is the "globals" space
//! [`crate::register::RegisterFile`] describes. Every other function body
//! gets its own fresh register file. A function referencing a sibling
//! function or a top-level const never addresses the module frame's
//! registers directly — register indices are only meaningful within the
//! frame that owns them — so it reaches them the same way it reaches any
//! enclosing local: through [`orus_symbols::SymbolTable`]'s upvalue-capture
//! machinery, closing over the module's top-level activation. That
//! activation never returns for as long as the module is loaded, so its
//! upvalues never need `OP_CLOSE_UPVALUE_R`.
//!
//! Struct values are arrays: a struct's fields compile to array slots in
//! declared order, so `base.field` and `base[index]` share one opcode pair
//! (`OP_INDEX_GET_R`/`OP_INDEX_SET_R`), the field name resolved to its
//! ordinal at compile time via the declaring [`orus_ast::StructDecl`].

#[cfg(feature = "std")]
use std::{boxed::Box, collections::HashMap, rc::Rc, string::{String, ToString}, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, collections::BTreeMap as HashMap, rc::Rc, string::{String, ToString}, vec::Vec};

use orus_ast::{AssignTarget, BinaryOp, Block, Expr, FunctionDecl, Item, Literal, Program, Span, Stmt, Type, UnaryOp, UseDecl};
use orus_bytecode::{BytecodeBuffer, Chunk, ChunkError, Function as BcFunction, Opcode};
use orus_core::{rope::ObjString, Value};
use orus_optimizer::{OptimizerContext, PassRegistry};
use orus_symbols::{
    BindingId, BindingKind, FunctionId as SymFunctionId, Resolution, ScopeKind, StrInterner, Symbol, SymbolError,
    SymbolTable,
};

use crate::error::{CompileError, CompileResult};
use crate::module::{ExportEntry, ExportKind, ModuleManager};
use crate::register::RegisterFile;

/// The native registry key the host/VM binds `runtime.raise` to.
const RAISE_INTRINSIC: &str = "runtime.raise";
/// Internal binding name for the raise stub; `$` can never start a parsed identifier.
const RAISE_BINDING_NAME: &str = "$raise";

struct PendingFunction {
    name: String,
    arity: u32,
    start_offset: u32,
    register_count: u8,
    intrinsic_symbol: Option<String>,
}

#[derive(Clone)]
struct FnInfo {
    binding_id: BindingId,
    proto_index: usize,
    sym_id: Option<SymFunctionId>,
    return_type: Type,
    param_types: Vec<Type>,
}

struct LoopCtx {
    label: Option<String>,
    /// Where a `continue` jumps to, when that's already known when the loop
    /// is entered (plain `while`, `for .. in`); `None` when it's only known
    /// after the body compiles (fused `while`/`for-range`), in which case
    /// `continue` targets land in `continue_patches` instead.
    continue_target: Option<usize>,
    continue_patches: Vec<usize>,
    break_patches: Vec<usize>,
}

/// The whole compiled output of one module.
#[derive(Debug)]
pub struct CompileUnit {
    /// The bytecode shared by every function compiled from this module.
    pub chunk: Rc<Chunk>,
    /// Every function compiled from this module, `"<module>"` last.
    pub functions: Vec<BcFunction>,
    /// Index into `functions` of the synthesized module top-level.
    pub module_function_index: u32,
}

/// Lowers one module's [`Program`] into bytecode.
pub struct Compiler {
    module_name: String,
    buffer: BytecodeBuffer,
    symbols: SymbolTable,
    interner: StrInterner,
    regs: RegisterFile,
    pending_functions: Vec<PendingFunction>,
    struct_decls: HashMap<String, Vec<(String, Type)>>,
    enum_decls: HashMap<String, Vec<(String, u32, Vec<Type>)>>,
    function_table: HashMap<String, FnInfo>,
    const_bindings: HashMap<String, BindingId>,
    binding_registers: HashMap<BindingId, u8>,
    binding_types: HashMap<BindingId, Type>,
    loop_stack: Vec<LoopCtx>,
    current_line: u32,
    raise_symbol: Symbol,
    raise_binding: BindingId,
    optimizer_ctx: OptimizerContext,
    run_optimizer: bool,
}

impl Compiler {
    /// A fresh compiler for a module named `module_name` (its dotted `use` path).
    pub fn new(module_name: impl Into<String>) -> Self {
        let mut interner = StrInterner::new();
        let mut symbols = SymbolTable::new();
        let mut regs = RegisterFile::new();
        let raise_symbol = interner.intern(RAISE_BINDING_NAME);
        let raise_binding = symbols
            .declare(raise_symbol, BindingKind::Local, false, 0)
            .expect("first declaration in a fresh symbol table cannot collide");
        let raise_register = regs.alloc_global().expect("register file starts empty");
        let mut binding_registers = HashMap::default();
        binding_registers.insert(raise_binding, raise_register);

        Compiler {
            module_name: module_name.into(),
            buffer: BytecodeBuffer::new(),
            symbols,
            interner,
            regs,
            pending_functions: vec![PendingFunction {
                name: RAISE_INTRINSIC.to_string(),
                arity: 1,
                start_offset: 0,
                register_count: 1,
                intrinsic_symbol: Some(RAISE_INTRINSIC.to_string()),
            }],
            struct_decls: HashMap::default(),
            enum_decls: HashMap::default(),
            function_table: HashMap::default(),
            const_bindings: HashMap::default(),
            binding_registers,
            binding_types: HashMap::default(),
            loop_stack: Vec::new(),
            current_line: 0,
            raise_symbol,
            raise_binding,
            optimizer_ctx: OptimizerContext::new(),
            run_optimizer: true,
        }
    }

    /// Disables the loop-fusion/constant-folding pass registry for this
    /// compilation, leaving the AST exactly as handed in. Hosts expose this
    /// as a `VmConfig` knob for bisecting optimizer-induced miscompiles.
    #[must_use]
    pub fn without_optimizer(mut self) -> Self {
        self.run_optimizer = false;
        self
    }

    /// Compiles `program` into a linked [`CompileUnit`], registering this
    /// module's exports with `module_manager` once every item is declared.
    pub fn compile(mut self, program: &mut Program, module_manager: &mut ModuleManager) -> CompileResult<CompileUnit> {
        if self.run_optimizer {
            let (_report, ctx) = PassRegistry::with_defaults().run_all_with_context(program);
            self.optimizer_ctx = ctx;
        }

        self.collect_declarations(program, module_manager)?;
        for item in &program.items {
            if let Item::Function(f) = item {
                self.compile_function_decl(f)?;
            }
        }

        let entry_offset = self.buffer.count() as u32;
        self.compile_module_init(program)?;
        self.buffer.emit_instruction(Opcode::ReturnVoid, &[]);
        let module_register_count = self.regs.high_water();

        self.register_exports(module_manager)?;

        let chunk = Rc::new(Chunk { buffer: self.buffer });
        let mut functions = Vec::with_capacity(self.pending_functions.len() + 1);
        for pf in self.pending_functions {
            functions.push(BcFunction::with_metadata(
                pf.name,
                pf.arity,
                chunk.clone(),
                pf.start_offset,
                pf.register_count,
                pf.intrinsic_symbol,
            ));
        }
        functions.push(BcFunction::with_metadata(
            "<module>",
            0,
            chunk.clone(),
            entry_offset,
            module_register_count,
            None,
        ));
        let module_function_index = (functions.len() - 1) as u32;

        Ok(CompileUnit { chunk, functions, module_function_index })
    }

    // ---- declaration collection -------------------------------------------------

    fn collect_declarations(&mut self, program: &Program, module_manager: &mut ModuleManager) -> CompileResult<()> {
        for item in &program.items {
            match item {
                Item::Struct(s) => {
                    let fields = s.fields.iter().map(|f| (f.name.clone(), f.ty.clone())).collect();
                    self.struct_decls.insert(s.name.clone(), fields);
                }
                Item::Enum(e) => {
                    let variants = e
                        .variants
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (v.name.clone(), i as u32, v.fields.clone()))
                        .collect();
                    self.enum_decls.insert(e.name.clone(), variants);
                }
                _ => {}
            }
        }

        for item in &program.items {
            match item {
                Item::Const(c) => {
                    let sym = self.interner.intern(&c.name);
                    let binding_id = self
                        .symbols
                        .declare(sym, BindingKind::Local, false, c.span.line)
                        .map_err(|e| self.name_err(e, c.span.line))?;
                    let reg = self
                        .regs
                        .alloc_global()
                        .ok_or(CompileError::RegistersExhausted { line: c.span.line })?;
                    self.binding_registers.insert(binding_id, reg);
                    self.binding_types.insert(binding_id, c.ty.clone());
                    self.const_bindings.insert(c.name.clone(), binding_id);
                }
                Item::Function(f) => {
                    let sym = self.interner.intern(&f.name);
                    let binding_id = self
                        .symbols
                        .declare(sym, BindingKind::Local, false, f.span.line)
                        .map_err(|e| self.name_err(e, f.span.line))?;
                    let reg = self
                        .regs
                        .alloc_global()
                        .ok_or(CompileError::RegistersExhausted { line: f.span.line })?;
                    self.binding_registers.insert(binding_id, reg);
                    let proto_index = self.pending_functions.len();
                    self.pending_functions.push(PendingFunction {
                        name: f.name.clone(),
                        arity: f.params.len() as u32,
                        start_offset: 0,
                        register_count: 0,
                        intrinsic_symbol: None,
                    });
                    self.function_table.insert(
                        f.name.clone(),
                        FnInfo {
                            binding_id,
                            proto_index,
                            sym_id: None,
                            return_type: f.return_type.clone(),
                            param_types: f.params.iter().map(|p| p.ty.clone()).collect(),
                        },
                    );
                }
                Item::Use(u) => self.compile_use(u, module_manager)?,
                Item::Struct(_) | Item::Enum(_) => {}
            }
        }
        Ok(())
    }

    /// Resolves every imported name against the module manager and binds it
    /// as a module-global. No bytecode is emitted here: this compile only
    /// *records* which foreign value each import names. The module resolver
    /// (a separate component, run at load time after dependency modules have
    /// already executed their own `"<module>"` body) copies the resolved
    /// value into the bound register before this module's own body runs.
    fn compile_use(&mut self, use_decl: &UseDecl, module_manager: &mut ModuleManager) -> CompileResult<()> {
        let module_path = use_decl.module.join(".");
        for name in &use_decl.names {
            let ty = module_manager.resolve_export(&module_path, name, use_decl.span.line)?.ty.clone();

            let sym = self.interner.intern(name);
            let binding_id = self
                .symbols
                .declare(sym, BindingKind::Import, false, use_decl.span.line)
                .map_err(|e| self.name_err(e, use_decl.span.line))?;
            let reg = self
                .regs
                .alloc_global()
                .ok_or(CompileError::RegistersExhausted { line: use_decl.span.line })?;
            self.binding_registers.insert(binding_id, reg);
            self.binding_types.insert(binding_id, ty);
            module_manager.import_variable(&self.module_name, name, &module_path, reg);
        }
        Ok(())
    }

    fn register_exports(&mut self, module_manager: &mut ModuleManager) -> CompileResult<()> {
        let functions: Vec<(String, FnInfo)> =
            self.function_table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (name, info) in functions {
            let reg = self.binding_registers[&info.binding_id];
            let ty = Type::Function { params: info.param_types, ret: Box::new(info.return_type) };
            module_manager.register_module_export(
                &self.module_name,
                ExportEntry {
                    name,
                    kind: ExportKind::Function,
                    register: reg,
                    ty,
                    function_index: Some(info.proto_index as u32),
                    intrinsic_symbol: None,
                },
                0,
            )?;
        }
        let consts: Vec<(String, BindingId)> =
            self.const_bindings.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for (name, binding_id) in consts {
            let reg = self.binding_registers[&binding_id];
            let ty = self.binding_types.get(&binding_id).cloned().unwrap_or(Type::Void);
            module_manager.register_module_export(
                &self.module_name,
                ExportEntry {
                    name,
                    kind: ExportKind::Global,
                    register: reg,
                    ty,
                    function_index: None,
                    intrinsic_symbol: None,
                },
                0,
            )?;
        }
        Ok(())
    }

    // ---- module top-level --------------------------------------------------------

    fn compile_module_init(&mut self, program: &Program) -> CompileResult<()> {
        self.materialize_function_value(0, self.raise_binding, None)?;
        for item in &program.items {
            if let Item::Function(f) = item {
                let info = self.function_table.get(&f.name).expect("declared in collect_declarations").clone();
                self.materialize_function_value(info.proto_index, info.binding_id, info.sym_id)?;
            }
        }
        for item in &program.items {
            if let Item::Const(c) = item {
                let binding_id = self.const_bindings[&c.name];
                let reg = self.binding_registers[&binding_id];
                self.set_loc(&c.span);
                self.compile_expr_into(&c.value, reg)?;
            }
        }
        Ok(())
    }

    fn materialize_function_value(
        &mut self,
        proto_index: usize,
        binding_id: BindingId,
        sym_id: Option<SymFunctionId>,
    ) -> CompileResult<()> {
        let dst = self.binding_registers[&binding_id];
        let upvalues = sym_id.map(|id| self.symbols.upvalues_of(id).to_vec()).unwrap_or_default();
        if upvalues.is_empty() {
            self.emit_load_const(dst, Value::Function(proto_index as u32));
            return Ok(());
        }
        let func_reg = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        self.emit_load_const(func_reg, Value::Function(proto_index as u32));
        let mut operands = Vec::with_capacity(3 + upvalues.len() * 2);
        operands.push(dst);
        operands.push(func_reg);
        operands.push(upvalues.len() as u8);
        for uv in &upvalues {
            let idx = if uv.is_local {
                self.binding_registers[&uv.binding]
            } else {
                uv.parent_upvalue_index.expect("non-local upvalue always carries a parent index") as u8
            };
            operands.push(uv.is_local as u8);
            operands.push(idx);
        }
        self.buffer.emit_instruction(Opcode::ClosureR, &operands);
        self.regs.free_temp(func_reg);
        Ok(())
    }

    fn compile_function_decl(&mut self, f: &FunctionDecl) -> CompileResult<()> {
        let saved_regs = core::mem::take(&mut self.regs);
        self.regs = RegisterFile::new();

        let sym_id = self.symbols.enter_function();
        let proto_index = self.function_table[&f.name].proto_index;
        self.function_table.get_mut(&f.name).expect("declared above").sym_id = Some(sym_id);

        let start_offset = self.buffer.count() as u32;
        self.set_loc(&f.span);

        for p in &f.params {
            let sym = self.interner.intern(&p.name);
            let binding_id = self
                .symbols
                .declare(sym, BindingKind::Param, false, p.span.line)
                .map_err(|e| self.name_err(e, p.span.line))?;
            let reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: p.span.line })?;
            self.binding_registers.insert(binding_id, reg);
            self.binding_types.insert(binding_id, p.ty.clone());
        }

        self.compile_block_with_scope(&f.body, false)?;
        self.buffer.emit_instruction(Opcode::ReturnVoid, &[]);
        self.symbols.exit_function();

        let register_count = self.regs.high_water();
        self.pending_functions[proto_index].start_offset = start_offset;
        self.pending_functions[proto_index].register_count = register_count;
        self.regs = saved_regs;
        Ok(())
    }

    // ---- statements ----------------------------------------------------------------

    fn compile_block_with_scope(&mut self, block: &Block, create_scope: bool) -> CompileResult<()> {
        if create_scope {
            self.symbols.push_scope(ScopeKind::Block);
        }
        let mark = self.regs.mark();
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        if create_scope {
            self.regs.free_to_mark(mark);
            self.symbols.pop_scope();
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Let { name, mutable, ty, value, span } => {
                self.set_loc(span);
                let src = self.compile_expr(value)?;
                let sym = self.interner.intern(name);
                let binding_id = self
                    .symbols
                    .declare(sym, BindingKind::Local, *mutable, span.line)
                    .map_err(|e| self.name_err(e, span.line))?;
                let reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: span.line })?;
                self.buffer.emit_instruction(Opcode::MoveR, &[reg, src]);
                self.regs.free_temp(src);
                self.binding_registers.insert(binding_id, reg);
                self.binding_types.insert(binding_id, ty.clone());
                Ok(())
            }
            Stmt::Assign { target, value, span } => self.compile_assignment(target, value, span),
            Stmt::ExprStmt(expr) => {
                let r = self.compile_expr(expr)?;
                self.regs.free_temp(r);
                Ok(())
            }
            Stmt::Return(Some(expr), span) => {
                self.set_loc(span);
                let r = self.compile_expr(expr)?;
                self.buffer.emit_instruction(Opcode::ReturnR, &[r]);
                self.regs.free_temp(r);
                Ok(())
            }
            Stmt::Return(None, span) => {
                self.set_loc(span);
                self.buffer.emit_instruction(Opcode::ReturnVoid, &[]);
                Ok(())
            }
            Stmt::Raise(expr, span) => self.compile_raise(expr, span),
            Stmt::While { condition, body, label, span } => self.compile_while(condition, body, label, span),
            Stmt::ForRange { var, start, end, step, inclusive, body, label, span } => {
                self.compile_for_range(var, start, end, step.as_ref(), *inclusive, body, label, span)
            }
            Stmt::ForIter { var, iterable, body, label, span } => {
                self.compile_for_iter(var, iterable, body, label, span)
            }
            Stmt::If { condition, then_block, else_block, span } => {
                self.compile_if(condition, then_block, else_block.as_ref(), span)
            }
            Stmt::TryCatch { try_block, catch_name, catch_block, span } => {
                self.compile_try_catch(try_block, catch_name.as_deref(), catch_block, span)
            }
            Stmt::Break(label, span) => self.compile_break(label.as_deref(), span),
            Stmt::Continue(label, span) => self.compile_continue(label.as_deref(), span),
        }
    }

    fn compile_raise(&mut self, expr: &Expr, span: &Span) -> CompileResult<()> {
        self.set_loc(span);
        let val_reg = self.compile_expr(expr)?;
        let resolution =
            self.symbols.resolve_variable_or_upvalue(self.raise_symbol).map_err(|e| self.name_err(e, span.line))?;
        let func_reg = self.load_resolution(resolution)?;
        let result_reg = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: span.line })?;
        self.buffer.emit_instruction(Opcode::CallR, &[func_reg, val_reg, 1, result_reg]);
        self.regs.free_temp(func_reg);
        self.regs.free_temp(val_reg);
        self.regs.free_temp(result_reg);
        Ok(())
    }

    fn compile_if(&mut self, condition: &Expr, then_block: &Block, else_block: Option<&Block>, span: &Span) -> CompileResult<()> {
        self.set_loc(span);
        let cond = self.compile_expr(condition)?;
        let skip_then = self.emit_jump(Opcode::JumpIfNotR, &[cond])?;
        self.regs.free_temp(cond);
        self.compile_block_with_scope(then_block, true)?;
        if let Some(else_block) = else_block {
            let skip_else = self.emit_jump(Opcode::Jump, &[])?;
            self.patch_to(skip_then, self.buffer.count())?;
            self.compile_block_with_scope(else_block, true)?;
            self.patch_to(skip_else, self.buffer.count())?;
        } else {
            self.patch_to(skip_then, self.buffer.count())?;
        }
        Ok(())
    }

    fn compile_try_catch(
        &mut self,
        try_block: &Block,
        catch_name: Option<&str>,
        catch_block: &Block,
        span: &Span,
    ) -> CompileResult<()> {
        self.set_loc(span);
        self.symbols.push_scope(ScopeKind::Block);
        let mark = self.regs.mark();
        let catch_operand = if let Some(name) = catch_name {
            let sym = self.interner.intern(name);
            let binding_id = self
                .symbols
                .declare(sym, BindingKind::Local, false, span.line)
                .map_err(|e| self.name_err(e, span.line))?;
            let reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: span.line })?;
            self.binding_registers.insert(binding_id, reg);
            self.binding_types.insert(binding_id, Type::Error);
            reg
        } else {
            0xFF
        };

        let try_begin = self.emit_jump(Opcode::TryBegin, &[catch_operand])?;
        self.compile_block_with_scope(try_block, true)?;
        self.buffer.emit_instruction(Opcode::TryEnd, &[]);
        let skip_catch = self.emit_jump(Opcode::Jump, &[])?;

        self.patch_to(try_begin, self.buffer.count())?;
        self.compile_block_with_scope(catch_block, false)?;
        self.patch_to(skip_catch, self.buffer.count())?;

        self.regs.free_to_mark(mark);
        self.symbols.pop_scope();
        Ok(())
    }

    // ---- loops -----------------------------------------------------------------------

    fn find_loop(&self, label: Option<&str>) -> Option<usize> {
        match label {
            Some(l) => self.loop_stack.iter().rposition(|lc| lc.label.as_deref() == Some(l)),
            None => (!self.loop_stack.is_empty()).then(|| self.loop_stack.len() - 1),
        }
    }

    fn compile_break(&mut self, label: Option<&str>, span: &Span) -> CompileResult<()> {
        let idx = self.find_loop(label).ok_or(CompileError::BreakOutsideLoop { line: span.line })?;
        self.set_loc(span);
        let patch = self.emit_jump(Opcode::Jump, &[])?;
        self.loop_stack[idx].break_patches.push(patch);
        Ok(())
    }

    fn compile_continue(&mut self, label: Option<&str>, span: &Span) -> CompileResult<()> {
        let idx = self.find_loop(label).ok_or(CompileError::ContinueOutsideLoop { line: span.line })?;
        self.set_loc(span);
        if let Some(target) = self.loop_stack[idx].continue_target {
            let patch = self.emit_jump(Opcode::Jump, &[])?;
            self.patch_to(patch, target)?;
        } else {
            let patch = self.emit_jump(Opcode::Jump, &[])?;
            self.loop_stack[idx].continue_patches.push(patch);
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Block, label: &Option<String>, span: &Span) -> CompileResult<()> {
        if let Some((var_name, limit_expr)) = fused_while_shape(condition, body) {
            return self.compile_while_fused(&var_name, limit_expr, body, label, span);
        }

        self.set_loc(span);
        let top = self.buffer.count();
        self.loop_stack.push(LoopCtx {
            label: label.clone(),
            continue_target: Some(top),
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });

        let cond = self.compile_expr(condition)?;
        let exit_patch = self.emit_jump(Opcode::JumpIfNotR, &[cond])?;
        self.regs.free_temp(cond);
        self.compile_block_with_scope(body, true)?;
        self.emit_back_jump(top)?;

        let loop_end = self.buffer.count();
        self.patch_to(exit_patch, loop_end)?;
        let ctx = self.loop_stack.pop().expect("just pushed");
        for p in ctx.break_patches {
            self.patch_to(p, loop_end)?;
        }
        Ok(())
    }

    fn compile_while_fused(
        &mut self,
        var_name: &str,
        limit_expr: &Expr,
        body: &Block,
        label: &Option<String>,
        span: &Span,
    ) -> CompileResult<()> {
        #[cfg(feature = "tracing")]
        tracing::trace!(var = var_name, line = span.line, "fused loop");
        self.set_loc(span);
        let sym = self.interner.intern(var_name);
        let resolution = self.symbols.resolve_variable_or_upvalue(sym).map_err(|e| self.name_err(e, span.line))?;
        let var_reg = match resolution {
            Resolution::Local(binding) => self.binding_registers[&binding],
            Resolution::Upvalue { .. } => return self.compile_while_generic(var_name, limit_expr, body, label, span),
        };

        let limit_reg = self.compile_expr(limit_expr)?;
        let top = self.buffer.count();
        self.loop_stack.push(LoopCtx {
            label: label.clone(),
            continue_target: None,
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });

        let exit_patch = self.emit_jump(Opcode::JumpIfNotI32Typed, &[var_reg, limit_reg])?;
        self.compile_loop_body_minus_trailing_increment(body)?;

        let increment_point = self.buffer.count();
        let ctx = self.loop_stack.last().expect("pushed above");
        let continue_patches = ctx.continue_patches.clone();
        for p in &continue_patches {
            self.patch_to(*p, increment_point)?;
        }
        let inc_cmp_patch = self.emit_jump(Opcode::IncCmpJmp, &[var_reg, limit_reg])?;
        self.patch_to(inc_cmp_patch, top)?;

        let loop_end = self.buffer.count();
        self.patch_to(exit_patch, loop_end)?;
        let ctx = self.loop_stack.pop().expect("just pushed");
        for p in ctx.break_patches {
            self.patch_to(p, loop_end)?;
        }
        self.regs.free_temp(limit_reg);
        Ok(())
    }

    /// Generic fallback when a syntactically fused-looking `while` turns out
    /// to loop over a captured (upvalue) counter, which `IncCmpJmp` can't
    /// address directly.
    fn compile_while_generic(&mut self, var_name: &str, limit_expr: &Expr, body: &Block, label: &Option<String>, span: &Span) -> CompileResult<()> {
        let rebuilt = Expr::Binary {
            left: Box::new(Expr::Ident(var_name.to_string())),
            op: BinaryOp::Lt,
            right: Box::new(limit_expr.clone()),
        };
        let top = self.buffer.count();
        self.loop_stack.push(LoopCtx {
            label: label.clone(),
            continue_target: Some(top),
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });
        let cond = self.compile_expr(&rebuilt)?;
        let exit_patch = self.emit_jump(Opcode::JumpIfNotR, &[cond])?;
        self.regs.free_temp(cond);
        self.compile_block_with_scope(body, true)?;
        self.emit_back_jump(top)?;
        let loop_end = self.buffer.count();
        self.patch_to(exit_patch, loop_end)?;
        let ctx = self.loop_stack.pop().expect("just pushed");
        for p in ctx.break_patches {
            self.patch_to(p, loop_end)?;
        }
        Ok(())
    }

    /// Compiles every statement in `body` except a single trailing
    /// `x = x + 1` on the fused counter, which the caller emits itself via
    /// `OP_INC_CMP_JMP`/`OP_INC_T_CHECKED`.
    fn compile_loop_body_minus_trailing_increment(&mut self, body: &Block) -> CompileResult<()> {
        self.symbols.push_scope(ScopeKind::Loop);
        let mark = self.regs.mark();
        let n = body.stmts.len();
        let skip_last = n > 0 && is_self_increment(&body.stmts[n - 1]);
        let take = if skip_last { n - 1 } else { n };
        for stmt in &body.stmts[..take] {
            self.compile_stmt(stmt)?;
        }
        self.regs.free_to_mark(mark);
        self.symbols.pop_scope();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_for_range(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        inclusive: bool,
        body: &Block,
        label: &Option<String>,
        span: &Span,
    ) -> CompileResult<()> {
        self.set_loc(span);
        self.symbols.push_scope(ScopeKind::Loop);
        let mark = self.regs.mark();

        let var_reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: span.line })?;
        self.compile_expr_into(start, var_reg)?;
        let var_sym = self.interner.intern(var);
        let var_binding = self
            .symbols
            .declare(var_sym, BindingKind::Local, false, span.line)
            .map_err(|e| self.name_err(e, span.line))?;
        self.binding_registers.insert(var_binding, var_reg);
        self.binding_types.insert(var_binding, Type::I32);

        let limit_reg = self.compile_expr(end)?;
        if inclusive {
            self.buffer.set_location(span.line, span.column);
            let one = (1i32).to_le_bytes();
            self.buffer.emit_instruction(Opcode::AddI32Imm, &[limit_reg, one[0], one[1], one[2], one[3]]);
        }

        let result = if step.is_none() {
            self.compile_for_range_fused(var_reg, limit_reg, body, label)
        } else {
            self.compile_for_range_generic(var_reg, limit_reg, step.expect("checked above"), inclusive, body, label)
        };

        self.regs.free_to_mark(mark);
        self.symbols.pop_scope();
        result
    }

    fn compile_for_range_fused(&mut self, var_reg: u8, limit_reg: u8, body: &Block, label: &Option<String>) -> CompileResult<()> {
        #[cfg(feature = "tracing")]
        tracing::trace!(var_reg, "fused loop");
        let top = self.buffer.count();
        self.loop_stack.push(LoopCtx {
            label: label.clone(),
            continue_target: None,
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });
        let guard = self.emit_jump(Opcode::JumpIfNotI32Typed, &[var_reg, limit_reg])?;
        self.compile_block_with_scope(body, true)?;

        let increment_point = self.buffer.count();
        let ctx = self.loop_stack.last().expect("pushed above");
        let continue_patches = ctx.continue_patches.clone();
        for p in &continue_patches {
            self.patch_to(*p, increment_point)?;
        }
        let inc_cmp_patch = self.emit_jump(Opcode::IncCmpJmp, &[var_reg, limit_reg])?;
        self.patch_to(inc_cmp_patch, top)?;

        let loop_end = self.buffer.count();
        self.patch_to(guard, loop_end)?;
        let ctx = self.loop_stack.pop().expect("just pushed");
        for p in ctx.break_patches {
            self.patch_to(p, loop_end)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_for_range_generic(
        &mut self,
        var_reg: u8,
        limit_reg: u8,
        step_expr: &Expr,
        inclusive: bool,
        body: &Block,
        label: &Option<String>,
    ) -> CompileResult<()> {
        let step_reg = self.compile_expr(step_expr)?;
        let ascending = is_nonneg_step(step_expr);
        let cmp_op = match (ascending, inclusive) {
            (true, false) => Opcode::LtR,
            (true, true) => Opcode::LeR,
            (false, false) => Opcode::GtR,
            (false, true) => Opcode::GeR,
        };

        let top = self.buffer.count();
        self.loop_stack.push(LoopCtx {
            label: label.clone(),
            continue_target: None,
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });

        let cond = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        self.buffer.emit_instruction(cmp_op, &[cond, var_reg, limit_reg]);
        let guard = self.emit_jump(Opcode::JumpIfNotR, &[cond])?;
        self.regs.free_temp(cond);

        self.compile_block_with_scope(body, true)?;

        let increment_point = self.buffer.count();
        let ctx = self.loop_stack.last().expect("pushed above");
        let continue_patches = ctx.continue_patches.clone();
        for p in &continue_patches {
            self.patch_to(*p, increment_point)?;
        }
        self.buffer.emit_instruction(Opcode::AddI32Typed, &[var_reg, var_reg, step_reg]);
        self.emit_back_jump(top)?;

        let loop_end = self.buffer.count();
        self.patch_to(guard, loop_end)?;
        let ctx = self.loop_stack.pop().expect("just pushed");
        for p in ctx.break_patches {
            self.patch_to(p, loop_end)?;
        }
        self.regs.free_temp(step_reg);
        Ok(())
    }

    fn compile_for_iter(&mut self, var: &str, iterable: &Expr, body: &Block, label: &Option<String>, span: &Span) -> CompileResult<()> {
        self.set_loc(span);
        self.symbols.push_scope(ScopeKind::Loop);
        let mark = self.regs.mark();

        let iter_src = self.compile_expr(iterable)?;
        let iter_reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: span.line })?;
        self.buffer.emit_instruction(Opcode::GetIterR, &[iter_reg, iter_src]);
        self.regs.free_temp(iter_src);

        let var_reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: span.line })?;
        let var_sym = self.interner.intern(var);
        let var_binding = self
            .symbols
            .declare(var_sym, BindingKind::Local, false, span.line)
            .map_err(|e| self.name_err(e, span.line))?;
        self.binding_registers.insert(var_binding, var_reg);
        self.binding_types.insert(var_binding, Type::Void);

        let has_reg = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: span.line })?;

        let top = self.buffer.count();
        self.loop_stack.push(LoopCtx {
            label: label.clone(),
            continue_target: Some(top),
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
        });

        self.buffer.emit_instruction(Opcode::IterNextR, &[var_reg, iter_reg, has_reg]);
        let guard = self.emit_jump(Opcode::JumpIfNotR, &[has_reg])?;
        self.compile_block_with_scope(body, true)?;
        self.emit_back_jump(top)?;

        let loop_end = self.buffer.count();
        self.patch_to(guard, loop_end)?;
        let ctx = self.loop_stack.pop().expect("just pushed");
        for p in ctx.break_patches {
            self.patch_to(p, loop_end)?;
        }

        self.regs.free_to_mark(mark);
        self.symbols.pop_scope();
        Ok(())
    }

    // ---- assignment --------------------------------------------------------------

    fn compile_assignment(&mut self, target: &AssignTarget, value: &Expr, span: &Span) -> CompileResult<()> {
        self.set_loc(span);
        match target {
            AssignTarget::Name(name) => {
                let sym = self.interner.intern(name);
                let (resolution, hoisted) = match self.symbols.resolve_assignment_target(sym) {
                    Ok(resolution) => (resolution, None),
                    Err(SymbolError::Unresolved { .. }) => {
                        // Branch-hoisting: an assignment to a name with no
                        // existing binding implicitly declares one, mutable,
                        // in the nearest enclosing function scope.
                        self.symbols.errors.pop();
                        let resolution = self.symbols.declare_or_hoist(sym, span.line);
                        (resolution, Some(resolution))
                    }
                    Err(e) => return Err(self.name_err(e, span.line)),
                };
                if let Some(Resolution::Local(binding_id)) = hoisted {
                    // Hoisted past the scope it was assigned in, so its
                    // register must survive that scope's `free_to_mark`.
                    let reg = self
                        .regs
                        .alloc_global()
                        .ok_or(CompileError::RegistersExhausted { line: span.line })?;
                    self.binding_registers.insert(binding_id, reg);
                }
                match resolution {
                    Resolution::Local(binding_id) => {
                        let reg = self.binding_registers[&binding_id];
                        if is_self_increment_of(target, value, name) {
                            self.buffer.emit_instruction(Opcode::IncTChecked, &[reg]);
                        } else {
                            let src = self.compile_expr(value)?;
                            self.buffer.emit_instruction(Opcode::MoveR, &[reg, src]);
                            self.regs.free_temp(src);
                        }
                    }
                    Resolution::Upvalue { index, .. } => {
                        let src = self.compile_expr(value)?;
                        self.buffer.emit_instruction(Opcode::SetUpvalueR, &[index as u8, src]);
                        self.regs.free_temp(src);
                    }
                }
                Ok(())
            }
            AssignTarget::Index { base, index } => {
                let breg = self.compile_expr(base)?;
                let ireg = self.compile_expr(index)?;
                let vreg = self.compile_expr(value)?;
                self.buffer.emit_instruction(Opcode::IndexSetR, &[breg, ireg, vreg]);
                self.regs.free_temp(vreg);
                self.regs.free_temp(ireg);
                self.regs.free_temp(breg);
                Ok(())
            }
            AssignTarget::Field { base, field } => {
                let breg = self.compile_expr(base)?;
                let ordinal = self.resolve_field_ordinal(base, field, span.line)?;
                let ireg = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: span.line })?;
                self.emit_load_i32(ireg, ordinal as i32);
                let vreg = self.compile_expr(value)?;
                self.buffer.emit_instruction(Opcode::IndexSetR, &[breg, ireg, vreg]);
                self.regs.free_temp(vreg);
                self.regs.free_temp(ireg);
                self.regs.free_temp(breg);
                Ok(())
            }
        }
    }

    // ---- expressions ---------------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<u8> {
        match expr {
            Expr::Literal(lit) => self.compile_literal(lit),
            Expr::Ident(name) => self.compile_ident(name),
            Expr::Call { callee, args } => self.compile_call(callee, args),
            Expr::Binary { left, op: BinaryOp::And, right } => self.compile_and(left, right),
            Expr::Binary { left, op: BinaryOp::Or, right } => self.compile_or(left, right),
            Expr::Binary { left, op, right } => self.compile_binary(left, *op, right),
            Expr::Unary { op, expr } => self.compile_unary(*op, expr),
            Expr::Index { base, index } => {
                let breg = self.compile_expr(base)?;
                let ireg = self.compile_expr(index)?;
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::IndexGetR, &[dst, breg, ireg]);
                self.regs.free_temp(ireg);
                self.regs.free_temp(breg);
                Ok(dst)
            }
            Expr::Field { base, field } => {
                let breg = self.compile_expr(base)?;
                let ordinal = self.resolve_field_ordinal(base, field, self.current_line)?;
                let ireg = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.emit_load_i32(ireg, ordinal as i32);
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::IndexGetR, &[dst, breg, ireg]);
                self.regs.free_temp(ireg);
                self.regs.free_temp(breg);
                Ok(dst)
            }
            Expr::Array(elems) => {
                let first = self.alloc_contiguous(elems.len().max(1))?;
                for (i, e) in elems.iter().enumerate() {
                    self.compile_expr_into(e, first + i as u8)?;
                }
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::NewArrayR, &[dst, first, elems.len() as u8]);
                self.free_contiguous(first, elems.len());
                Ok(dst)
            }
            Expr::StructInit { type_name, fields } => self.compile_struct_init(type_name, fields),
            Expr::EnumInit { type_name, variant, args } => self.compile_enum_init(type_name, variant, args),
        }
    }

    fn compile_literal(&mut self, lit: &Literal) -> CompileResult<u8> {
        let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        match lit {
            Literal::I32(n) => self.emit_load_i32(dst, *n),
            Literal::I64(n) => self.emit_load_const(dst, Value::I64(*n)),
            Literal::U32(n) => self.emit_load_const(dst, Value::U32(*n)),
            Literal::U64(n) => self.emit_load_const(dst, Value::U64(*n)),
            Literal::F64(n) => self.emit_load_const(dst, Value::F64(*n)),
            Literal::Bool(b) => {
                self.buffer.emit_instruction(Opcode::LoadBoolR, &[dst, *b as u8]);
            }
            Literal::Str(s) => self.emit_load_const(dst, Value::String(ObjString::from_owned(s.clone()))),
            Literal::Bytes(b) => self.emit_load_const(dst, Value::Bytes(Rc::new(b.clone()))),
        };
        Ok(dst)
    }

    fn compile_ident(&mut self, name: &str) -> CompileResult<u8> {
        let sym = self.interner.intern(name);
        let resolution =
            self.symbols.resolve_variable_or_upvalue(sym).map_err(|e| self.name_err(e, self.current_line))?;
        self.load_resolution(resolution)
    }

    fn load_resolution(&mut self, resolution: Resolution) -> CompileResult<u8> {
        match resolution {
            Resolution::Local(binding_id) => {
                let src = self.binding_registers[&binding_id];
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::MoveR, &[dst, src]);
                Ok(dst)
            }
            Resolution::Upvalue { index, .. } => {
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::GetUpvalueR, &[dst, index as u8]);
                Ok(dst)
            }
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr]) -> CompileResult<u8> {
        let arg_count = args.len();
        let first = self.alloc_contiguous(arg_count.max(1))?;
        for (i, a) in args.iter().enumerate() {
            self.compile_expr_into(a, first + i as u8)?;
        }
        let func_reg = self.compile_expr(callee)?;
        let result_reg = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        self.buffer.emit_instruction(Opcode::CallR, &[func_reg, first, arg_count as u8, result_reg]);
        self.regs.free_temp(func_reg);
        self.free_contiguous(first, arg_count);
        Ok(result_reg)
    }

    fn compile_and(&mut self, left: &Expr, right: &Expr) -> CompileResult<u8> {
        let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        let lreg = self.compile_expr(left)?;
        self.buffer.emit_instruction(Opcode::MoveR, &[dst, lreg]);
        self.regs.free_temp(lreg);
        let skip = self.emit_jump(Opcode::JumpIfNotR, &[dst])?;
        let rreg = self.compile_expr(right)?;
        self.buffer.emit_instruction(Opcode::MoveR, &[dst, rreg]);
        self.regs.free_temp(rreg);
        self.patch_to(skip, self.buffer.count())?;
        Ok(dst)
    }

    fn compile_or(&mut self, left: &Expr, right: &Expr) -> CompileResult<u8> {
        let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        let lreg = self.compile_expr(left)?;
        self.buffer.emit_instruction(Opcode::MoveR, &[dst, lreg]);
        self.regs.free_temp(lreg);
        let evaluate_right = self.emit_jump(Opcode::JumpIfNotR, &[dst])?;
        let skip_right = self.emit_jump(Opcode::Jump, &[])?;
        self.patch_to(evaluate_right, self.buffer.count())?;
        let rreg = self.compile_expr(right)?;
        self.buffer.emit_instruction(Opcode::MoveR, &[dst, rreg]);
        self.regs.free_temp(rreg);
        self.patch_to(skip_right, self.buffer.count())?;
        Ok(dst)
    }

    fn compile_binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> CompileResult<u8> {
        let lreg = self.compile_expr(left)?;
        let rreg = self.compile_expr(right)?;
        let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        let opcode = match op {
            BinaryOp::Add => Opcode::AddI32R,
            BinaryOp::Sub => Opcode::SubI32R,
            BinaryOp::Mul => Opcode::MulI32R,
            BinaryOp::Div => Opcode::DivI32R,
            BinaryOp::Mod => Opcode::ModI32R,
            BinaryOp::Eq => Opcode::EqR,
            BinaryOp::Ne => Opcode::NeR,
            BinaryOp::Lt => Opcode::LtR,
            BinaryOp::Le => Opcode::LeR,
            BinaryOp::Gt => Opcode::GtR,
            BinaryOp::Ge => Opcode::GeR,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled in compile_expr"),
        };
        self.buffer.emit_instruction(opcode, &[dst, lreg, rreg]);
        self.regs.free_temp(rreg);
        self.regs.free_temp(lreg);
        Ok(dst)
    }

    fn compile_unary(&mut self, op: UnaryOp, expr: &Expr) -> CompileResult<u8> {
        match op {
            UnaryOp::Neg => {
                let r = self.compile_expr(expr)?;
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.emit_load_i32(dst, 0);
                self.buffer.emit_instruction(Opcode::SubI32R, &[dst, dst, r]);
                self.regs.free_temp(r);
                Ok(dst)
            }
            UnaryOp::Not => {
                let r = self.compile_expr(expr)?;
                let false_reg = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::LoadBoolR, &[false_reg, 0]);
                let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
                self.buffer.emit_instruction(Opcode::EqR, &[dst, r, false_reg]);
                self.regs.free_temp(false_reg);
                self.regs.free_temp(r);
                Ok(dst)
            }
        }
    }

    fn compile_struct_init(&mut self, type_name: &str, fields: &[(String, Expr)]) -> CompileResult<u8> {
        let decl = self
            .struct_decls
            .get(type_name)
            .cloned()
            .ok_or(CompileError::UnknownType { name: type_name.to_string(), line: self.current_line })?;
        let n = decl.len();
        let first = self.alloc_contiguous(n.max(1))?;
        for (ordinal, (field_name, _ty)) in decl.iter().enumerate() {
            let (_, init_expr) = fields.iter().find(|(f, _)| f == field_name).ok_or_else(|| {
                CompileError::UnknownField {
                    struct_name: type_name.to_string(),
                    field: field_name.clone(),
                    line: self.current_line,
                }
            })?;
            self.compile_expr_into(init_expr, first + ordinal as u8)?;
        }
        let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        self.buffer.emit_instruction(Opcode::NewArrayR, &[dst, first, n as u8]);
        self.free_contiguous(first, n);
        Ok(dst)
    }

    fn compile_enum_init(&mut self, type_name: &str, variant: &str, args: &[Expr]) -> CompileResult<u8> {
        let variants = self
            .enum_decls
            .get(type_name)
            .cloned()
            .ok_or(CompileError::UnknownType { name: type_name.to_string(), line: self.current_line })?;
        let variant_index = variants.iter().position(|(name, _, _)| name == variant).ok_or_else(|| {
            CompileError::UnknownField {
                struct_name: type_name.to_string(),
                field: variant.to_string(),
                line: self.current_line,
            }
        })?;
        let descriptor = format!("{type_name}::{variant}::{variant_index}");
        let desc_const = self.buffer.add_constant(Value::String(ObjString::from_owned(descriptor))) as u16;
        let bytes = desc_const.to_le_bytes();

        let arg_count = args.len();
        let first = self.alloc_contiguous(arg_count.max(1))?;
        for (i, a) in args.iter().enumerate() {
            self.compile_expr_into(a, first + i as u8)?;
        }
        let dst = self.regs.alloc_temp().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        self.buffer.emit_instruction(Opcode::NewEnumR, &[dst, bytes[0], bytes[1], first, arg_count as u8]);
        self.free_contiguous(first, arg_count);
        Ok(dst)
    }

    /// Compiles `expr` so its value ends up in exactly `dst`.
    fn compile_expr_into(&mut self, expr: &Expr, dst: u8) -> CompileResult<()> {
        let src = self.compile_expr(expr)?;
        if src != dst {
            self.buffer.emit_instruction(Opcode::MoveR, &[dst, src]);
            self.regs.free_temp(src);
        }
        Ok(())
    }

    // ---- struct field resolution -----------------------------------------------------

    fn resolve_field_ordinal(&mut self, base: &Expr, field: &str, line: u32) -> CompileResult<usize> {
        match self.static_type_of(base) {
            Some(Type::Struct(name)) => self
                .struct_decls
                .get(&name)
                .and_then(|fs| fs.iter().position(|(n, _)| n == field))
                .ok_or(CompileError::UnknownField { struct_name: name, field: field.to_string(), line }),
            _ => Err(CompileError::UnknownField {
                struct_name: "<unresolved>".to_string(),
                field: field.to_string(),
                line,
            }),
        }
    }

    fn static_type_of(&mut self, expr: &Expr) -> Option<Type> {
        match expr {
            Expr::Ident(name) => {
                let sym = self.interner.intern(name);
                let binding = self.symbols.resolve_variable_or_upvalue(sym).ok()?.binding();
                self.binding_types.get(&binding).cloned()
            }
            Expr::Call { callee, .. } => {
                if let Expr::Ident(fname) = callee.as_ref() {
                    self.function_table.get(fname).map(|info| info.return_type.clone())
                } else {
                    None
                }
            }
            Expr::Field { base, field } => match self.static_type_of(base)? {
                Type::Struct(name) => {
                    self.struct_decls.get(&name)?.iter().find(|(n, _)| n == field).map(|(_, ty)| ty.clone())
                }
                _ => None,
            },
            Expr::Index { base, .. } => match self.static_type_of(base)? {
                Type::Array(inner) => Some(*inner),
                _ => None,
            },
            Expr::StructInit { type_name, .. } => Some(Type::Struct(type_name.clone())),
            Expr::EnumInit { type_name, .. } => Some(Type::Enum(type_name.clone())),
            _ => None,
        }
    }

    // ---- low-level emission helpers -------------------------------------------------

    fn set_loc(&mut self, span: &Span) {
        self.current_line = span.line;
        self.buffer.set_location(span.line, span.column);
    }

    fn emit_load_const(&mut self, dst: u8, value: Value) {
        let idx = self.buffer.add_constant(value) as u16;
        let b = idx.to_le_bytes();
        self.buffer.emit_instruction(Opcode::LoadConstR, &[dst, b[0], b[1]]);
    }

    fn emit_load_i32(&mut self, dst: u8, n: i32) {
        let idx = self.buffer.add_constant(Value::I32(n)) as u16;
        let b = idx.to_le_bytes();
        self.buffer.emit_instruction(Opcode::LoadI32Const, &[dst, b[0], b[1]]);
    }

    fn emit_jump(&mut self, opcode: Opcode, fixed_operands: &[u8]) -> CompileResult<usize> {
        self.buffer.emit_instruction(opcode, fixed_operands);
        self.buffer.allocate_jump_placeholder(opcode).map_err(|e| CompileError::Emission { source: e, line: self.current_line })
    }

    fn patch_to(&mut self, patch_index: usize, target: usize) -> CompileResult<()> {
        self.buffer
            .patch_jump(patch_index, target)
            .map_err(|e| CompileError::Emission { source: e, line: self.current_line })
    }

    /// Emits the back-edge to `top`, the already-known start of a loop body.
    /// No placeholder is needed since the target is known up front: picks
    /// `OP_LOOP_SHORT`'s single unsigned byte when the distance fits (≤ 255),
    /// falling back to the wide `OP_JUMP` otherwise.
    fn emit_back_jump(&mut self, top: usize) -> CompileResult<()> {
        let short_field_end = self.buffer.count() + 2;
        let short_distance = short_field_end as i64 - top as i64;
        if (0..=i64::from(u8::MAX)).contains(&short_distance) {
            self.buffer.emit_instruction(Opcode::LoopShort, &[short_distance as u8]);
            return Ok(());
        }

        let wide_field_end = self.buffer.count() + 3;
        let distance = wide_field_end as i64 - top as i64;
        let offset = i16::try_from(-distance)
            .map_err(|_| CompileError::Emission {
                source: ChunkError::OffsetOutOfRange { offset: -distance, width: 16 },
                line: self.current_line,
            })?;
        self.buffer.emit_instruction(Opcode::Jump, &offset.to_le_bytes());
        Ok(())
    }

    fn alloc_contiguous(&mut self, n: usize) -> CompileResult<u8> {
        let first = self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        for _ in 1..n {
            self.regs.alloc_frame().ok_or(CompileError::RegistersExhausted { line: self.current_line })?;
        }
        Ok(first)
    }

    fn free_contiguous(&mut self, first: u8, count: usize) {
        for i in (0..count.max(1)).rev() {
            self.regs.free_temp(first + i as u8);
        }
    }

    fn name_err(&self, source: orus_symbols::SymbolError, line: u32) -> CompileError {
        CompileError::Name { source, line }
    }
}

/// Detects the `while x < limit { ...; x = x + 1 }` shape `OP_INC_CMP_JMP`
/// can fuse: the condition is a plain `<` test against the same counter the
/// body's last statement increments by exactly one.
fn fused_while_shape<'a>(condition: &'a Expr, body: &Block) -> Option<(String, &'a Expr)> {
    let Expr::Binary { left, op: BinaryOp::Lt, right } = condition else { return None };
    let Expr::Ident(var_name) = left.as_ref() else { return None };
    let last = body.stmts.last()?;
    if is_self_increment_named(last, var_name) {
        Some((var_name.clone(), right.as_ref()))
    } else {
        None
    }
}

fn is_self_increment(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Assign { target: AssignTarget::Name(name), value, .. } => is_self_increment_of(&AssignTarget::Name(name.clone()), value, name),
        _ => false,
    }
}

fn is_self_increment_named(stmt: &Stmt, name: &str) -> bool {
    match stmt {
        Stmt::Assign { target: AssignTarget::Name(n), value, .. } if n == name => {
            is_self_increment_of(&AssignTarget::Name(n.clone()), value, name)
        }
        _ => false,
    }
}

fn is_self_increment_of(target: &AssignTarget, value: &Expr, name: &str) -> bool {
    let AssignTarget::Name(_) = target else { return false };
    matches!(
        value,
        Expr::Binary { left, op: BinaryOp::Add, right }
            if matches!(left.as_ref(), Expr::Ident(l) if l == name)
                && matches!(right.as_ref(), Expr::Literal(Literal::I32(1)))
    )
}

fn is_nonneg_step(step: &Expr) -> bool {
    match step {
        Expr::Literal(Literal::I32(n)) => *n >= 0,
        Expr::Literal(Literal::I64(n)) => *n >= 0,
        Expr::Unary { op: UnaryOp::Neg, expr } if matches!(expr.as_ref(), Expr::Literal(_)) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use orus_ast::{Field, FunctionDecl, Param, StructDecl};

    fn span() -> Span {
        Span::new(1, 1, 0)
    }

    fn empty_program() -> Program {
        Program { items: Vec::new() }
    }

    #[test]
    fn compiles_an_empty_module_to_a_module_function() {
        let mut program = empty_program();
        let mut mm = ModuleManager::new();
        let unit = Compiler::new("main").compile(&mut program, &mut mm).unwrap();
        let module_fn = &unit.functions[unit.module_function_index as usize];
        assert_eq!(module_fn.name, "<module>");
    }

    #[test]
    fn const_initializer_compiles_into_the_module_body() {
        let mut program = Program {
            items: vec![Item::Const(orus_ast::ConstDecl {
                name: "pi".to_string(),
                ty: Type::I32,
                value: Expr::Literal(Literal::I32(3)),
                span: span(),
            })],
        };
        let mut mm = ModuleManager::new();
        let unit = Compiler::new("main").compile(&mut program, &mut mm).unwrap();
        assert!(unit.chunk.buffer.count() > 0);
        let exported = mm.resolve_export("main", "pi", 1).unwrap();
        assert_eq!(exported.kind, ExportKind::Global);
    }

    #[test]
    fn a_function_referencing_a_sibling_const_becomes_a_closure() {
        let mut program = Program {
            items: vec![
                Item::Const(orus_ast::ConstDecl {
                    name: "limit".to_string(),
                    ty: Type::I32,
                    value: Expr::Literal(Literal::I32(10)),
                    span: span(),
                }),
                Item::Function(FunctionDecl {
                    name: "get_limit".to_string(),
                    params: Vec::new(),
                    return_type: Type::I32,
                    body: Block { stmts: vec![Stmt::Return(Some(Expr::Ident("limit".to_string())), span())], span: span() },
                    span: span(),
                }),
            ],
        };
        let mut mm = ModuleManager::new();
        let unit = Compiler::new("main").compile(&mut program, &mut mm).unwrap();
        assert!(unit.functions.iter().any(|f| f.name == "get_limit"));
    }

    #[test]
    fn struct_field_access_resolves_to_an_ordinal_index_get() {
        let mut program = Program {
            items: vec![
                Item::Struct(StructDecl {
                    name: "Point".to_string(),
                    fields: vec![
                        Field { name: "x".to_string(), ty: Type::I32, span: span() },
                        Field { name: "y".to_string(), ty: Type::I32, span: span() },
                    ],
                    span: span(),
                }),
                Item::Function(FunctionDecl {
                    name: "get_y".to_string(),
                    params: vec![Param { name: "p".to_string(), ty: Type::Struct("Point".to_string()), span: span() }],
                    return_type: Type::I32,
                    body: Block {
                        stmts: vec![Stmt::Return(
                            Some(Expr::Field { base: Box::new(Expr::Ident("p".to_string())), field: "y".to_string() }),
                            span(),
                        )],
                        span: span(),
                    },
                    span: span(),
                }),
            ],
        };
        let mut mm = ModuleManager::new();
        let unit = Compiler::new("main").compile(&mut program, &mut mm).unwrap();
        assert!(unit.functions.iter().any(|f| f.name == "get_y"));
    }

    #[test]
    fn break_outside_a_loop_is_rejected() {
        let mut program = Program {
            items: vec![Item::Function(FunctionDecl {
                name: "f".to_string(),
                params: Vec::new(),
                return_type: Type::Void,
                body: Block { stmts: vec![Stmt::Break(None, span())], span: span() },
                span: span(),
            })],
        };
        let mut mm = ModuleManager::new();
        let err = Compiler::new("main").compile(&mut program, &mut mm).unwrap_err();
        assert!(matches!(err, CompileError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn unresolved_use_reports_module_not_found() {
        let mut program = Program {
            items: vec![Item::Use(UseDecl {
                module: vec!["math".to_string()],
                names: vec!["pi".to_string()],
                span: span(),
            })],
        };
        let mut mm = ModuleManager::new();
        let err = Compiler::new("main").compile(&mut program, &mut mm).unwrap_err();
        assert!(matches!(err, CompileError::ModuleNotFound { .. }));
    }

    #[test]
    fn back_jump_at_distance_255_uses_loop_short_and_256_uses_wide_jump() {
        let mut compiler = Compiler::new("main");
        let top = compiler.buffer.count();
        while compiler.buffer.count() + 2 - top < 255 {
            compiler.buffer.emit_instruction(Opcode::ReturnVoid, &[]);
        }
        let before = compiler.buffer.count();
        compiler.emit_back_jump(top).unwrap();
        assert_eq!(compiler.buffer.code()[before], Opcode::LoopShort as u8);

        let mut compiler = Compiler::new("main");
        let top = compiler.buffer.count();
        while compiler.buffer.count() + 2 - top < 256 {
            compiler.buffer.emit_instruction(Opcode::ReturnVoid, &[]);
        }
        let before = compiler.buffer.count();
        compiler.emit_back_jump(top).unwrap();
        assert_eq!(compiler.buffer.code()[before], Opcode::Jump as u8);
    }
}
