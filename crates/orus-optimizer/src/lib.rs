//! orus-optimizer — the pass registry that runs between the typed AST and
//! Codegen (C7).
//!
//! Unlike a CFG-level IR optimizer, every pass here walks the typed AST
//! directly: there is no separate basic-block form to lower into first.
//! Passes run in registration order; a pass reporting failure is logged and
//! skipped, it never aborts the rest of the pipeline.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{boxed::Box, string::String, vec, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, string::String, vec, vec::Vec};

use orus_ast::{Block, Expr, FunctionDecl, Item, Literal, Program, Span, Stmt, UnaryOp};

/// Which typed shadow bank a loop-bound binding should prefer residing in,
/// per the affinity pass's recommendation. Codegen is free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedBank {
    /// `i32` shadow bank.
    I32,
    /// `i64` shadow bank.
    I64,
    /// `u32` shadow bank.
    U32,
    /// `u64` shadow bank.
    U64,
    /// `f64` shadow bank.
    F64,
    /// Boxed-only; no typed shadow bank applies.
    Boxed,
}

/// A residency recommendation for one loop, keyed by the loop's [`Span`] so
/// Codegen (which walks the same tree) can look it up without the AST
/// needing a dedicated loop-id field of its own.
#[derive(Debug, Clone, Default)]
pub struct LoopPlan {
    /// Per-binding bank preference inside this loop's body.
    pub bindings: Vec<(String, TypedBank)>,
}

/// Shared state passes read and write across one `run_all` invocation.
#[derive(Debug, Default)]
pub struct OptimizerContext {
    loop_plans: Vec<(Span, LoopPlan)>,
}

impl OptimizerContext {
    /// A fresh context with no loop plans recorded yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or replaces) the plan for the loop at `span`.
    pub fn set_loop_plan(&mut self, span: Span, plan: LoopPlan) {
        if let Some(slot) = self.loop_plans.iter_mut().find(|(s, _)| *s == span) {
            slot.1 = plan;
        } else {
            self.loop_plans.push((span, plan));
        }
    }

    /// The residency plan Codegen should consult for the loop at `span`, if
    /// the affinity pass ran and produced one.
    pub fn plan_for(&self, span: Span) -> Option<&LoopPlan> {
        self.loop_plans.iter().find(|(s, _)| *s == span).map(|(_, plan)| plan)
    }
}

/// Outcome of one pass over one program. Field names match the contract
/// every pass reports against, regardless of what the pass actually does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassResult {
    /// `false` if the pass could not complete (logged, pipeline continues).
    pub success: bool,
    /// Total rewrites the pass made, of any kind.
    pub optimizations_applied: u32,
    /// AST nodes removed as a result of those rewrites.
    pub nodes_eliminated: u32,
    /// Literal nodes produced by folding.
    pub constants_folded: u32,
    /// Binary-expression nodes specifically folded into a single literal.
    pub binary_expressions_folded: u32,
}

impl PassResult {
    fn ok() -> Self {
        PassResult { success: true, ..Default::default() }
    }

    fn add(&mut self, other: PassResult) {
        self.optimizations_applied += other.optimizations_applied;
        self.nodes_eliminated += other.nodes_eliminated;
        self.constants_folded += other.constants_folded;
        self.binary_expressions_folded += other.binary_expressions_folded;
    }
}

/// One optimization pass over the typed AST.
pub trait Pass {
    /// The pass's registry name, used in reports and log lines.
    fn name(&self) -> &str;
    /// Runs the pass over `program`, mutating it in place.
    fn run(&mut self, program: &mut Program, ctx: &mut OptimizerContext) -> PassResult;
}

/// Per-pass results from one `run_all` call, in registration order.
#[derive(Debug, Default)]
pub struct Report {
    /// `(pass name, its result)`, in the order passes ran.
    pub per_pass: Vec<(String, PassResult)>,
    /// Sum of every enabled pass's counts.
    pub totals: PassResult,
}

/// An ordered list of named passes, each independently enabled or disabled.
#[derive(Default)]
pub struct PassRegistry {
    entries: Vec<(bool, Box<dyn Pass>)>,
}

impl PassRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pass`, enabled or not, at the end of the run order.
    pub fn register<P: Pass + 'static>(&mut self, enabled: bool, pass: P) {
        self.entries.push((enabled, Box::new(pass)));
    }

    /// The default pipeline: constant folding, loop affinity planning, then
    /// the declared-but-no-op dead-code-elimination and CSE passes.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(true, ConstantFold::default());
        reg.register(true, LoopAffinity::default());
        reg.register(true, DeadCodeElim);
        reg.register(true, CommonSubexprElim);
        reg
    }

    /// Runs every enabled pass over `program` in registration order. A
    /// pass reporting `success: false` is logged and skipped; later passes
    /// still run. The residency context populated along the way (loop
    /// affinity plans) is discarded; use [`Self::run_all_with_context`] to
    /// keep it.
    pub fn run_all(&mut self, program: &mut Program) -> Report {
        self.run_all_with_context(program).0
    }

    /// Like [`Self::run_all`], but also returns the [`OptimizerContext`]
    /// passes populated, so Codegen can look up a loop's residency plan by
    /// span after the pipeline runs.
    pub fn run_all_with_context(&mut self, program: &mut Program) -> (Report, OptimizerContext) {
        let mut ctx = OptimizerContext::new();
        let mut report = Report::default();
        for (enabled, pass) in &mut self.entries {
            if !*enabled {
                continue;
            }
            let result = pass.run(program, &mut ctx);
            if !result.success {
                #[cfg(feature = "tracing")]
                tracing::warn!(pass = pass.name(), "optimizer pass did not complete");
            }
            report.totals.add(result);
            report.per_pass.push((String::from(pass.name()), result));
        }
        (report, ctx)
    }
}

/// Folds literal-only arithmetic and comparison subtrees into new literal
/// nodes, preserving the original's type.
#[derive(Default)]
pub struct ConstantFold;

impl Pass for ConstantFold {
    fn name(&self) -> &str {
        "constant-fold"
    }

    fn run(&mut self, program: &mut Program, _ctx: &mut OptimizerContext) -> PassResult {
        let mut result = PassResult::ok();
        for item in &mut program.items {
            match item {
                Item::Function(f) => fold_block(&mut f.body, &mut result),
                Item::Const(c) => {
                    fold_expr(&mut c.value, &mut result);
                }
                Item::Struct(_) | Item::Enum(_) | Item::Use(_) => {}
            }
        }
        result
    }
}

fn fold_block(block: &mut Block, result: &mut PassResult) {
    for stmt in &mut block.stmts {
        fold_stmt(stmt, result);
    }
}

fn fold_stmt(stmt: &mut Stmt, result: &mut PassResult) {
    match stmt {
        Stmt::Let { value, .. } | Stmt::Assign { value, .. } => fold_expr(value, result),
        Stmt::ExprStmt(e) => fold_expr(e, result),
        Stmt::Return(Some(e), _) | Stmt::Raise(e, _) => fold_expr(e, result),
        Stmt::Return(None, _) => {}
        Stmt::While { condition, body, .. } => {
            fold_expr(condition, result);
            fold_block(body, result);
        }
        Stmt::ForRange { start, end, step, body, .. } => {
            fold_expr(start, result);
            fold_expr(end, result);
            if let Some(step) = step {
                fold_expr(step, result);
            }
            fold_block(body, result);
        }
        Stmt::ForIter { iterable, body, .. } => {
            fold_expr(iterable, result);
            fold_block(body, result);
        }
        Stmt::If { condition, then_block, else_block, .. } => {
            fold_expr(condition, result);
            fold_block(then_block, result);
            if let Some(else_block) = else_block {
                fold_block(else_block, result);
            }
        }
        Stmt::TryCatch { try_block, catch_block, .. } => {
            fold_block(try_block, result);
            fold_block(catch_block, result);
        }
        Stmt::Break(..) | Stmt::Continue(..) => {}
    }
}

fn fold_expr(expr: &mut Expr, result: &mut PassResult) {
    match expr {
        Expr::Literal(_) | Expr::Ident(_) => {}
        Expr::Call { callee, args } => {
            fold_expr(callee, result);
            for a in args {
                fold_expr(a, result);
            }
        }
        Expr::Binary { left, op, right } => {
            fold_expr(left, result);
            fold_expr(right, result);
            if let (Expr::Literal(l), Expr::Literal(r)) = (left.as_ref(), right.as_ref()) {
                if let Some(folded) = fold_binary_literals(*op, l, r) {
                    *expr = Expr::Literal(folded);
                    result.constants_folded += 1;
                    result.binary_expressions_folded += 1;
                    result.optimizations_applied += 1;
                    result.nodes_eliminated += 1;
                }
            }
        }
        Expr::Unary { op, expr: inner } => {
            fold_expr(inner, result);
            if let Expr::Literal(l) = inner.as_ref() {
                if let Some(folded) = fold_unary_literal(*op, l) {
                    *expr = Expr::Literal(folded);
                    result.constants_folded += 1;
                    result.optimizations_applied += 1;
                    result.nodes_eliminated += 1;
                }
            }
        }
        Expr::Index { base, index } => {
            fold_expr(base, result);
            fold_expr(index, result);
        }
        Expr::Field { base, .. } => fold_expr(base, result),
        Expr::Array(elems) => {
            for e in elems {
                fold_expr(e, result);
            }
        }
        Expr::StructInit { fields, .. } => {
            for (_, v) in fields {
                fold_expr(v, result);
            }
        }
        Expr::EnumInit { args, .. } => {
            for a in args {
                fold_expr(a, result);
            }
        }
    }
}

fn fold_unary_literal(op: UnaryOp, lit: &Literal) -> Option<Literal> {
    match (op, lit) {
        (UnaryOp::Neg, Literal::I32(n)) => n.checked_neg().map(Literal::I32),
        (UnaryOp::Neg, Literal::I64(n)) => n.checked_neg().map(Literal::I64),
        (UnaryOp::Neg, Literal::F64(x)) => Some(Literal::F64(-x)),
        (UnaryOp::Not, Literal::Bool(b)) => Some(Literal::Bool(!b)),
        _ => None,
    }
}

fn fold_binary_literals(op: orus_ast::BinaryOp, l: &Literal, r: &Literal) -> Option<Literal> {
    use orus_ast::BinaryOp as B;
    match (l, r) {
        (Literal::I32(a), Literal::I32(b)) => fold_i32(op, *a, *b),
        (Literal::I64(a), Literal::I64(b)) => fold_i64(op, *a, *b),
        (Literal::U32(a), Literal::U32(b)) => fold_u32(op, *a, *b),
        (Literal::U64(a), Literal::U64(b)) => fold_u64(op, *a, *b),
        (Literal::F64(a), Literal::F64(b)) => fold_f64(op, *a, *b),
        (Literal::Bool(a), Literal::Bool(b)) => match op {
            B::And => Some(Literal::Bool(*a && *b)),
            B::Or => Some(Literal::Bool(*a || *b)),
            B::Eq => Some(Literal::Bool(a == b)),
            B::Ne => Some(Literal::Bool(a != b)),
            _ => None,
        },
        (Literal::Str(a), Literal::Str(b)) => match op {
            B::Eq => Some(Literal::Bool(a == b)),
            B::Ne => Some(Literal::Bool(a != b)),
            _ => None,
        },
        _ => None,
    }
}

macro_rules! fold_numeric {
    ($name:ident, $ty:ty, $variant:ident) => {
        fn $name(op: orus_ast::BinaryOp, a: $ty, b: $ty) -> Option<Literal> {
            use orus_ast::BinaryOp as B;
            match op {
                B::Add => a.checked_add(b).map(Literal::$variant),
                B::Sub => a.checked_sub(b).map(Literal::$variant),
                B::Mul => a.checked_mul(b).map(Literal::$variant),
                B::Div if b != 0 => a.checked_div(b).map(Literal::$variant),
                B::Mod if b != 0 => a.checked_rem(b).map(Literal::$variant),
                B::Div | B::Mod => None,
                B::Eq => Some(Literal::Bool(a == b)),
                B::Ne => Some(Literal::Bool(a != b)),
                B::Lt => Some(Literal::Bool(a < b)),
                B::Le => Some(Literal::Bool(a <= b)),
                B::Gt => Some(Literal::Bool(a > b)),
                B::Ge => Some(Literal::Bool(a >= b)),
                B::And | B::Or => None,
            }
        }
    };
}

fold_numeric!(fold_i32, i32, I32);
fold_numeric!(fold_i64, i64, I64);
fold_numeric!(fold_u32, u32, U32);
fold_numeric!(fold_u64, u64, U64);

fn fold_f64(op: orus_ast::BinaryOp, a: f64, b: f64) -> Option<Literal> {
    use orus_ast::BinaryOp as B;
    match op {
        B::Add => Some(Literal::F64(a + b)),
        B::Sub => Some(Literal::F64(a - b)),
        B::Mul => Some(Literal::F64(a * b)),
        B::Div => Some(Literal::F64(a / b)),
        B::Mod => Some(Literal::F64(a % b)),
        B::Eq => Some(Literal::Bool(a == b)),
        B::Ne => Some(Literal::Bool(a != b)),
        B::Lt => Some(Literal::Bool(a < b)),
        B::Le => Some(Literal::Bool(a <= b)),
        B::Gt => Some(Literal::Bool(a > b)),
        B::Ge => Some(Literal::Bool(a >= b)),
        B::And | B::Or => None,
    }
}

/// Attaches a typed-bank residency preference to every counted-loop binding
/// it finds. `while` loops get an empty plan recorded so Codegen always has
/// somewhere to look, even when there's nothing to prefer.
#[derive(Default)]
pub struct LoopAffinity;

impl Pass for LoopAffinity {
    fn name(&self) -> &str {
        "loop-affinity"
    }

    fn run(&mut self, program: &mut Program, ctx: &mut OptimizerContext) -> PassResult {
        let mut result = PassResult::ok();
        for item in &mut program.items {
            if let Item::Function(f) = item {
                plan_block(&f.body, ctx, &mut result);
            }
        }
        result
    }
}

fn plan_block(block: &Block, ctx: &mut OptimizerContext, result: &mut PassResult) {
    for stmt in &block.stmts {
        plan_stmt(stmt, ctx, result);
    }
}

fn plan_stmt(stmt: &Stmt, ctx: &mut OptimizerContext, result: &mut PassResult) {
    match stmt {
        Stmt::ForRange { var, start, body, span, .. } => {
            let bank = literal_bank(start).unwrap_or(TypedBank::I32);
            ctx.set_loop_plan(*span, LoopPlan { bindings: vec![(var.clone(), bank)] });
            result.optimizations_applied += 1;
            plan_block(body, ctx, result);
        }
        Stmt::ForIter { body, span, .. } => {
            ctx.set_loop_plan(*span, LoopPlan::default());
            plan_block(body, ctx, result);
        }
        Stmt::While { body, span, .. } => {
            ctx.set_loop_plan(*span, LoopPlan::default());
            plan_block(body, ctx, result);
        }
        Stmt::If { then_block, else_block, .. } => {
            plan_block(then_block, ctx, result);
            if let Some(else_block) = else_block {
                plan_block(else_block, ctx, result);
            }
        }
        Stmt::TryCatch { try_block, catch_block, .. } => {
            plan_block(try_block, ctx, result);
            plan_block(catch_block, ctx, result);
        }
        _ => {}
    }
}

fn literal_bank(expr: &Expr) -> Option<TypedBank> {
    match expr {
        Expr::Literal(Literal::I32(_)) => Some(TypedBank::I32),
        Expr::Literal(Literal::I64(_)) => Some(TypedBank::I64),
        Expr::Literal(Literal::U32(_)) => Some(TypedBank::U32),
        Expr::Literal(Literal::U64(_)) => Some(TypedBank::U64),
        Expr::Literal(Literal::F64(_)) => Some(TypedBank::F64),
        _ => None,
    }
}

/// Declared, not implemented: dead-code elimination has no effect yet.
#[derive(Default)]
pub struct DeadCodeElim;

impl Pass for DeadCodeElim {
    fn name(&self) -> &str {
        "dead-code-elim"
    }
    fn run(&mut self, _program: &mut Program, _ctx: &mut OptimizerContext) -> PassResult {
        PassResult::ok()
    }
}

/// Declared, not implemented: common-subexpression elimination has no
/// effect yet.
#[derive(Default)]
pub struct CommonSubexprElim;

impl Pass for CommonSubexprElim {
    fn name(&self) -> &str {
        "common-subexpr-elim"
    }
    fn run(&mut self, _program: &mut Program, _ctx: &mut OptimizerContext) -> PassResult {
        PassResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use orus_ast::{BinaryOp, Param, Type};

    fn span() -> Span {
        Span::new(1, 1, 0)
    }

    fn function(body: Block) -> Program {
        Program {
            items: vec![Item::Function(FunctionDecl {
                name: "main".into(),
                params: Vec::<Param>::new(),
                return_type: Type::Void,
                body,
                span: span(),
            })],
        }
    }

    #[test]
    fn folds_nested_integer_arithmetic_into_one_literal() {
        let expr = Expr::Binary {
            left: Box::new(Expr::Binary {
                left: Box::new(Expr::Literal(Literal::I32(2))),
                op: BinaryOp::Add,
                right: Box::new(Expr::Literal(Literal::I32(3))),
            }),
            op: BinaryOp::Mul,
            right: Box::new(Expr::Literal(Literal::I32(4))),
        };
        let mut program = function(Block {
            stmts: vec![Stmt::Return(Some(expr), span())],
            span: span(),
        });
        let mut registry = PassRegistry::new();
        registry.register(true, ConstantFold::default());
        let report = registry.run_all(&mut program);

        match &program.items[0] {
            Item::Function(f) => match &f.body.stmts[0] {
                Stmt::Return(Some(Expr::Literal(Literal::I32(20))), _) => {}
                other => panic!("expected folded literal 20, got {other:?}"),
            },
            _ => unreachable!(),
        }
        assert_eq!(report.totals.binary_expressions_folded, 2);
    }

    #[test]
    fn division_by_zero_is_left_unfolded() {
        let expr = Expr::Binary {
            left: Box::new(Expr::Literal(Literal::I32(10))),
            op: BinaryOp::Div,
            right: Box::new(Expr::Literal(Literal::I32(0))),
        };
        let mut program =
            function(Block { stmts: vec![Stmt::Return(Some(expr), span())], span: span() });
        let mut registry = PassRegistry::new();
        registry.register(true, ConstantFold::default());
        registry.run_all(&mut program);

        match &program.items[0] {
            Item::Function(f) => match &f.body.stmts[0] {
                Stmt::Return(Some(Expr::Binary { .. }), _) => {}
                other => panic!("expected unfolded binary, got {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn loop_affinity_records_a_plan_for_the_range_loop() {
        let for_range = Stmt::ForRange {
            var: "i".into(),
            start: Expr::Literal(Literal::I32(0)),
            end: Expr::Literal(Literal::I32(10)),
            step: None,
            inclusive: false,
            body: Block { stmts: Vec::new(), span: span() },
            label: None,
            span: span(),
        };
        let mut program = function(Block { stmts: vec![for_range], span: span() });
        let mut registry = PassRegistry::new();
        registry.register(true, LoopAffinity::default());
        registry.run_all(&mut program);

        // Re-run with a fresh context to confirm the plan is retrievable by span.
        let mut ctx = OptimizerContext::new();
        let mut result = PassResult::ok();
        if let Item::Function(f) = &program.items[0] {
            plan_block(&f.body, &mut ctx, &mut result);
        }
        let plan = ctx.plan_for(span()).unwrap();
        assert_eq!(plan.bindings, vec![("i".to_string(), TypedBank::I32)]);
    }

    #[test]
    fn default_pipeline_runs_every_registered_pass() {
        let mut program = function(Block { stmts: Vec::new(), span: span() });
        let mut registry = PassRegistry::with_defaults();
        let report = registry.run_all(&mut program);
        assert_eq!(report.per_pass.len(), 4);
        assert!(report.per_pass.iter().all(|(_, r)| r.success));
    }
}
