//! orus-ast — the typed abstract syntax tree Codegen (C6) consumes.
//!
//! Every node here is assumed to already carry a resolved [`Type`]: the
//! lexer/parser and the Hindley–Milner-style inferencer that annotates the
//! tree are external collaborators, out of scope for this crate. This crate
//! only defines the shapes Codegen walks.
//!
//! Features:
//! - `std` (default): plain `Vec`/`String`/`Box` from `std`.
//! - `serde`: derive (de)serialization on every node.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{boxed::Box, string::String, vec::Vec};

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, string::String, vec::Vec};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A position in the original source, carried through for diagnostics and
/// for the line/column map Codegen writes into the [`orus_bytecode::BytecodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Span {
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column.
    pub column: u32,
    /// Byte offset from the start of the file.
    pub offset: u32,
}

impl Span {
    /// Builds a span from its three coordinates.
    pub fn new(line: u32, column: u32, offset: u32) -> Self {
        Self { line, column, offset }
    }
}

/// A resolved type, as the inferencer would have annotated it. Mirrors
/// [`orus_core::Value`]'s tag set plus the declared-type-only notions
/// (`Void`, named struct/enum types, function types) that have no runtime
/// value representation of their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Type {
    /// `bool`.
    Bool,
    /// `i32`, the default integer literal type.
    I32,
    /// `i64`.
    I64,
    /// `u32`.
    U32,
    /// `u64`.
    U64,
    /// `f64`.
    F64,
    /// `string`.
    String,
    /// `bytes`.
    Bytes,
    /// `[T]`.
    Array(Box<Type>),
    /// A named struct type.
    Struct(String),
    /// A named enum type.
    Enum(String),
    /// The type bound to a `catch` handler's variable.
    Error,
    /// A function type, used for closures and first-class function values.
    Function {
        /// Parameter types, in declaration order.
        params: Vec<Type>,
        /// Return type.
        ret: Box<Type>,
    },
    /// No value (a function with no return type).
    Void,
}

/// A complete compilation unit: its top-level items, in source order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Program {
    /// Top-level declarations.
    pub items: Vec<Item>,
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Item {
    /// A function declaration.
    Function(FunctionDecl),
    /// A global constant.
    Const(ConstDecl),
    /// A struct type declaration.
    Struct(StructDecl),
    /// An enum type declaration.
    Enum(EnumDecl),
    /// A `use module::{a, b, c}` import.
    Use(UseDecl),
}

/// A function declaration, including closures lifted to top level by the
/// parser's desugaring (this crate never nests `Item::Function`).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FunctionDecl {
    /// The function's name.
    pub name: String,
    /// Positional parameters.
    pub params: Vec<Param>,
    /// Declared return type (`Type::Void` for no return value).
    pub return_type: Type,
    /// The function body.
    pub body: Block,
    /// Declaration site.
    pub span: Span,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Resolved type.
    pub ty: Type,
    /// Declaration site.
    pub span: Span,
}

/// A global constant declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstDecl {
    /// Constant name.
    pub name: String,
    /// Resolved type.
    pub ty: Type,
    /// Initializer, required for constants.
    pub value: Expr,
    /// Declaration site.
    pub span: Span,
}

/// A struct type declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StructDecl {
    /// Struct name.
    pub name: String,
    /// Declared fields, in declaration order.
    pub fields: Vec<Field>,
    /// Declaration site.
    pub span: Span,
}

/// A struct field.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Resolved type.
    pub ty: Type,
    /// Declaration site.
    pub span: Span,
}

/// An enum type declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnumDecl {
    /// Enum name.
    pub name: String,
    /// Declared variants, in declaration order (their index is their ordinal).
    pub variants: Vec<EnumVariant>,
    /// Declaration site.
    pub span: Span,
}

/// One variant of an enum declaration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnumVariant {
    /// Variant name.
    pub name: String,
    /// Payload field types, empty for a unit variant.
    pub fields: Vec<Type>,
    /// Declaration site.
    pub span: Span,
}

/// A `use module::{a, b, c}` import. `module` is the dotted path as written
/// (`a.b.c`), not yet normalized to a search-root-relative file path — that
/// happens in the module resolver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UseDecl {
    /// Dotted module path segments (`["a", "b", "c"]` for `a.b.c`).
    pub module: Vec<String>,
    /// Imported symbol names, in declared list order.
    pub names: Vec<String>,
    /// Declaration site.
    pub span: Span,
}

/// A sequence of statements sharing a lexical scope.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Block {
    /// Statements, in execution order.
    pub stmts: Vec<Stmt>,
    /// Span covering the block.
    pub span: Span,
}

/// An assignment's target, one of the three forms `compile_assignment` supports.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AssignTarget {
    /// Assignment to a bound name.
    Name(String),
    /// Assignment to `base[index]`.
    Index {
        /// The array expression.
        base: Box<Expr>,
        /// The index expression.
        index: Box<Expr>,
    },
    /// Assignment to `base.field`.
    Field {
        /// The struct expression.
        base: Box<Expr>,
        /// The field name.
        field: String,
    },
}

/// A statement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Stmt {
    /// A local binding. `mutable` distinguishes `let` from `let mut`.
    Let {
        /// Bound name.
        name: String,
        /// Whether the binding may be reassigned after initialization.
        mutable: bool,
        /// Resolved type.
        ty: Type,
        /// Initializer.
        value: Expr,
        /// Statement site.
        span: Span,
    },
    /// Assignment to an existing binding, array slot, or struct field.
    Assign {
        /// The assignment target.
        target: AssignTarget,
        /// The value being stored.
        value: Expr,
        /// Statement site.
        span: Span,
    },
    /// An expression evaluated for its side effects (commonly a call).
    ExprStmt(Expr),
    /// `return`, optionally carrying a value.
    Return(Option<Expr>, Span),
    /// `raise expr`.
    Raise(Expr, Span),
    /// A `while` loop; `label` names it for a labeled `break`/`continue`.
    While {
        /// Loop condition, re-evaluated each iteration.
        condition: Expr,
        /// Loop body.
        body: Block,
        /// Optional loop label.
        label: Option<String>,
        /// Statement site.
        span: Span,
    },
    /// `for var in start..end` (or `..=end`), with an optional step.
    ForRange {
        /// Loop variable name.
        var: String,
        /// Range start.
        start: Expr,
        /// Range end.
        end: Expr,
        /// Step expression; absent means `+1`.
        step: Option<Expr>,
        /// Whether `end` is included in the range.
        inclusive: bool,
        /// Loop body.
        body: Block,
        /// Optional loop label.
        label: Option<String>,
        /// Statement site.
        span: Span,
    },
    /// `for var in iterable`, where `iterable` is not a literal range.
    ForIter {
        /// Loop variable name.
        var: String,
        /// The iterable expression.
        iterable: Expr,
        /// Loop body.
        body: Block,
        /// Optional loop label.
        label: Option<String>,
        /// Statement site.
        span: Span,
    },
    /// `if condition { then_block } else { else_block }`.
    If {
        /// Branch condition.
        condition: Expr,
        /// Taken when `condition` is true.
        then_block: Block,
        /// Taken otherwise, if present.
        else_block: Option<Block>,
        /// Statement site.
        span: Span,
    },
    /// `try { try_block } catch (name) { catch_block }`.
    TryCatch {
        /// Guarded body.
        try_block: Block,
        /// Name bound to the caught error, if any.
        catch_name: Option<String>,
        /// Handler body.
        catch_block: Block,
        /// Statement site.
        span: Span,
    },
    /// `break`, optionally naming a loop label.
    Break(Option<String>, Span),
    /// `continue`, optionally naming a loop label.
    Continue(Option<String>, Span),
}

/// An expression.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Expr {
    /// A literal value.
    Literal(Literal),
    /// A reference to a bound name (local, upvalue, or global).
    Ident(String),
    /// A function call.
    Call {
        /// The called expression (usually an `Ident`).
        callee: Box<Expr>,
        /// Argument expressions, in call order.
        args: Vec<Expr>,
    },
    /// A binary operation.
    Binary {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// A unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        expr: Box<Expr>,
    },
    /// `base[index]`.
    Index {
        /// The array expression.
        base: Box<Expr>,
        /// The index expression.
        index: Box<Expr>,
    },
    /// `base.field`.
    Field {
        /// The struct expression.
        base: Box<Expr>,
        /// The field name.
        field: String,
    },
    /// An array literal.
    Array(Vec<Expr>),
    /// A struct literal `Name { field: value, ... }`.
    StructInit {
        /// The struct type's name.
        type_name: String,
        /// Field initializers, in source order.
        fields: Vec<(String, Expr)>,
    },
    /// An enum constructor `Name::Variant(args...)`.
    EnumInit {
        /// The enum type's name.
        type_name: String,
        /// The chosen variant's name.
        variant: String,
        /// Payload arguments, empty for a unit variant.
        args: Vec<Expr>,
    },
}

/// A literal value, already resolved to its concrete numeric width.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Literal {
    /// `i32` literal.
    I32(i32),
    /// `i64` literal.
    I64(i64),
    /// `u32` literal.
    U32(u32),
    /// `u64` literal.
    U64(u64),
    /// `f64` literal.
    F64(f64),
    /// `bool` literal.
    Bool(bool),
    /// String literal.
    Str(String),
    /// Byte-buffer literal.
    Bytes(Vec<u8>),
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinaryOp {
    /// `+`.
    Add,
    /// `-`.
    Sub,
    /// `*`.
    Mul,
    /// `/`.
    Div,
    /// `%`.
    Mod,
    /// `==`.
    Eq,
    /// `!=`.
    Ne,
    /// `<`.
    Lt,
    /// `<=`.
    Le,
    /// `>`.
    Gt,
    /// `>=`.
    Ge,
    /// `&&`.
    And,
    /// `||`.
    Or,
}

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnaryOp {
    /// Arithmetic negation (`-x`).
    Neg,
    /// Logical negation (`!x`).
    Not,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn for_range_and_for_iter_are_distinct_statement_shapes() {
        let span = Span::new(1, 1, 0);
        let for_range = Stmt::ForRange {
            var: "i".into(),
            start: Expr::Literal(Literal::I32(0)),
            end: Expr::Literal(Literal::I32(5)),
            step: None,
            inclusive: false,
            body: Block { stmts: Vec::new(), span },
            label: None,
            span,
        };
        let for_iter = Stmt::ForIter {
            var: "x".into(),
            iterable: Expr::Ident("items".into()),
            body: Block { stmts: Vec::new(), span },
            label: None,
            span,
        };
        assert_ne!(for_range, for_iter);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn literal_round_trips_through_json() {
        let lit = Literal::F64(2.5);
        let json = serde_json::to_string(&lit).unwrap();
        let back: Literal = serde_json::from_str(&json).unwrap();
        assert_eq!(lit, back);
    }

    #[test]
    fn assign_target_covers_all_three_forms() {
        let span = Span::new(1, 1, 0);
        let targets = [
            AssignTarget::Name("x".into()),
            AssignTarget::Index {
                base: Box::new(Expr::Ident("arr".into())),
                index: Box::new(Expr::Literal(Literal::I32(0))),
            },
            AssignTarget::Field { base: Box::new(Expr::Ident("s".into())), field: "f".into() },
        ];
        for target in targets {
            let _ = Stmt::Assign { target, value: Expr::Literal(Literal::Bool(true)), span };
        }
    }
}
