//! orus-symbols — scope and symbol-table engine backing name resolution.
//!
//! An event-driven engine, not an AST walker: the caller pushes/pops scopes
//! and functions, declares bindings, and asks to resolve a name. It carries
//! no dependency on `orus-ast`, so Codegen drives it directly from whatever
//! traversal order it already walks the typed tree in.
//!
//! `resolve_variable_or_upvalue` distinguishes three outcomes: a binding in
//! the current function's own scope chain, a binding captured from an
//! enclosing function (minted as a per-function upvalue, chained through
//! intermediate functions as needed), or unresolved.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::vec::Vec;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

#[cfg(feature = "std")]
use std::collections::HashMap;

#[cfg(not(feature = "std"))]
use alloc::collections::BTreeMap as HashMap;

pub use orus_mm::{StrInterner, Symbol};

/// Identifies a function's activation scope, for upvalue-chain resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

/// Identifies one pushed scope.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

/// Identifies one declared binding.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(u32);

/// What kind of scope boundary a pushed scope represents.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    /// A function body's top-level scope; bounds upvalue search.
    Function,
    /// A lexical block (`if`, `try`/`catch`, a bare `{ }`).
    Block,
    /// A loop body. Bumps branch depth for hoisting decisions.
    Loop,
}

/// Where a binding came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingKind {
    /// An ordinary `let` binding.
    Local,
    /// A function parameter.
    Param,
    /// A name brought in by `use`.
    Import,
}

/// A resolved name: either local to the current function, or reached by
/// capturing an enclosing function's binding as an upvalue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Resolved within the current function's own scope chain.
    Local(BindingId),
    /// Resolved by capture; `index` is this function's own upvalue slot.
    Upvalue {
        /// Index into this function's upvalue list, for
        /// `OP_GET_UPVALUE_R`/`OP_SET_UPVALUE_R`.
        index: u32,
        /// The binding ultimately captured, for diagnostics and mutability
        /// checks.
        binding: BindingId,
    },
}

impl Resolution {
    /// The binding this resolution ultimately names, regardless of form.
    #[must_use]
    pub fn binding(self) -> BindingId {
        match self {
            Resolution::Local(b) | Resolution::Upvalue { binding: b, .. } => b,
        }
    }
}

/// One entry in a function's upvalue list, in the shape `OP_CLOSURE_R`
/// needs at the function's creation site.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpvalueDescriptor {
    name: Symbol,
    /// `true` if this upvalue captures a local slot of the immediate
    /// enclosing function; `false` if it captures that function's own
    /// upvalue at `parent_upvalue_index`.
    pub is_local: bool,
    /// The binding ultimately captured.
    pub binding: BindingId,
    /// Valid when `is_local` is `false`: the parent function's upvalue
    /// index to copy from.
    pub parent_upvalue_index: Option<u32>,
}

/// A declared name and what's known about it.
#[derive(Clone, Debug)]
pub struct Binding {
    id: BindingId,
    /// The bound name.
    pub name: Symbol,
    /// Where the binding came from.
    pub kind: BindingKind,
    /// Whether the binding may be reassigned.
    pub mutable: bool,
    /// The scope it was declared in.
    pub scope: ScopeId,
    /// The function it belongs to.
    pub function: FunctionId,
    /// Source line of the declaration, for diagnostics.
    pub decl_line: u32,
}

impl Binding {
    /// This binding's id.
    #[must_use]
    pub fn id(&self) -> BindingId {
        self.id
    }
}

struct Scope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    function: FunctionId,
    branch_depth: u32,
    symbols: HashMap<Symbol, BindingId>,
}

struct FunctionScope {
    parent: Option<FunctionId>,
    /// The scope active in the parent function when this function was
    /// entered; upvalue search for this function's captures starts here.
    declared_in_scope: ScopeId,
    upvalues: Vec<UpvalueDescriptor>,
}

/// Resolution failures, named after the diagnostics they back.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum SymbolError {
    /// E1011: a name already declared in this same scope.
    #[cfg_attr(feature = "std", error("symbol already declared in this scope (prior declaration at line {prior_line})"))]
    Redeclared {
        /// The repeated name.
        name: Symbol,
        /// The line of the earlier declaration.
        prior_line: u32,
    },
    /// Assignment to a binding that was never declared mutable.
    #[cfg_attr(feature = "std", error("cannot assign to immutable binding (declared at line {decl_line})"))]
    ImmutableAssign {
        /// The assigned name.
        name: Symbol,
        /// The line the binding was declared at.
        decl_line: u32,
    },
    /// E3003/E3004: no binding found in any reachable scope.
    #[cfg_attr(feature = "std", error("undefined variable"))]
    Unresolved {
        /// The name that failed to resolve.
        name: Symbol,
    },
}

#[cfg(not(feature = "std"))]
impl core::fmt::Display for SymbolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SymbolError::Redeclared { prior_line, .. } => {
                write!(f, "symbol already declared in this scope (prior declaration at line {prior_line})")
            }
            SymbolError::ImmutableAssign { decl_line, .. } => {
                write!(f, "cannot assign to immutable binding (declared at line {decl_line})")
            }
            SymbolError::Unresolved { .. } => write!(f, "undefined variable"),
        }
    }
}

/// The scope/function stack and binding tables for one compilation unit.
pub struct SymbolTable {
    scopes: Vec<Scope>,
    bindings: Vec<Binding>,
    functions: Vec<FunctionScope>,
    scope_stack: Vec<ScopeId>,
    function_stack: Vec<FunctionId>,
    /// Every error produced so far, in the order they were raised.
    pub errors: Vec<SymbolError>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// A fresh table with one root function scope already pushed, for a
    /// script's top-level statements.
    #[must_use]
    pub fn new() -> Self {
        let mut table = Self {
            scopes: Vec::new(),
            bindings: Vec::new(),
            functions: Vec::new(),
            scope_stack: Vec::new(),
            function_stack: Vec::new(),
            errors: Vec::new(),
        };
        table.functions.push(FunctionScope {
            parent: None,
            declared_in_scope: ScopeId(0),
            upvalues: Vec::new(),
        });
        table.function_stack.push(FunctionId(0));
        table.push_scope(ScopeKind::Function);
        table
    }

    /// Pushes a scope nested under whatever is currently active.
    pub fn push_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let parent = self.scope_stack.last().copied();
        let function = *self.function_stack.last().expect("function stack empty");
        let parent_depth = parent.map_or(0, |p| self.scopes[p.0 as usize].branch_depth);
        let branch_depth = parent_depth + u32::from(kind == ScopeKind::Loop);
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope { kind, parent, function, branch_depth, symbols: HashMap::default() });
        self.scope_stack.push(id);
        id
    }

    /// Pops the innermost scope. Does not validate pending break/continue
    /// patches; that bookkeeping lives with the caller's own frame state.
    pub fn pop_scope(&mut self) {
        self.scope_stack.pop();
    }

    /// Enters a new function, nested under the currently active scope.
    /// Its own top-level scope (kind `Function`) is pushed automatically.
    pub fn enter_function(&mut self) -> FunctionId {
        let declared_in_scope = *self.scope_stack.last().expect("scope stack empty");
        let parent = self.function_stack.last().copied();
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(FunctionScope { parent, declared_in_scope, upvalues: Vec::new() });
        self.function_stack.push(id);
        self.push_scope(ScopeKind::Function);
        id
    }

    /// Leaves the current function, popping its top-level scope.
    pub fn exit_function(&mut self) {
        self.pop_scope();
        self.function_stack.pop();
    }

    /// Declares `name` in the current scope. E1011 if the same scope
    /// already holds this name.
    pub fn declare(
        &mut self,
        name: Symbol,
        kind: BindingKind,
        mutable: bool,
        line: u32,
    ) -> Result<BindingId, SymbolError> {
        let scope_id = *self.scope_stack.last().expect("scope stack empty");
        if let Some(&existing) = self.scopes[scope_id.0 as usize].symbols.get(&name) {
            let prior_line = self.bindings[existing.0 as usize].decl_line;
            let err = SymbolError::Redeclared { name, prior_line };
            self.errors.push(err.clone());
            return Err(err);
        }
        Ok(self.declare_in_scope(scope_id, name, kind, mutable, line))
    }

    fn declare_in_scope(
        &mut self,
        scope_id: ScopeId,
        name: Symbol,
        kind: BindingKind,
        mutable: bool,
        line: u32,
    ) -> BindingId {
        let function = self.scopes[scope_id.0 as usize].function;
        let id = BindingId(self.bindings.len() as u32);
        self.bindings.push(Binding { id, name, kind, mutable, scope: scope_id, function, decl_line: line });
        self.scopes[scope_id.0 as usize].symbols.insert(name, id);
        id
    }

    /// Looks up `name` starting at `start`, stopping at the boundary of
    /// `function` (a scope whose `function` differs belongs to an
    /// enclosing function and is not searched).
    fn lookup_in_function_from(
        &self,
        start: ScopeId,
        function: FunctionId,
        name: Symbol,
    ) -> Option<BindingId> {
        let mut cur = Some(start);
        while let Some(sid) = cur {
            let scope = &self.scopes[sid.0 as usize];
            if scope.function != function {
                break;
            }
            if let Some(&b) = scope.symbols.get(&name) {
                return Some(b);
            }
            cur = scope.parent;
        }
        None
    }

    /// Resolves `name` in the current function's scope chain, or failing
    /// that, as a capture from an enclosing function.
    pub fn resolve_variable_or_upvalue(&mut self, name: Symbol) -> Result<Resolution, SymbolError> {
        let current_function = *self.function_stack.last().expect("function stack empty");
        let start_scope = *self.scope_stack.last().expect("scope stack empty");
        if let Some(binding) = self.lookup_in_function_from(start_scope, current_function, name) {
            return Ok(Resolution::Local(binding));
        }
        if let Some(index) = self.resolve_upvalue_chain(current_function, name) {
            let binding = self.functions[current_function.0 as usize].upvalues[index as usize].binding;
            return Ok(Resolution::Upvalue { index, binding });
        }
        let err = SymbolError::Unresolved { name };
        self.errors.push(err.clone());
        Err(err)
    }

    /// Ensures `function` (and every function between it and wherever
    /// `name` is actually bound) carries the upvalue chain needed to reach
    /// it, returning `function`'s own upvalue index.
    fn resolve_upvalue_chain(&mut self, function: FunctionId, name: Symbol) -> Option<u32> {
        if let Some(existing) =
            self.functions[function.0 as usize].upvalues.iter().position(|u| u.name == name)
        {
            return Some(existing as u32);
        }
        let parent = self.functions[function.0 as usize].parent?;
        let declared_in_scope = self.functions[function.0 as usize].declared_in_scope;
        if let Some(binding) = self.lookup_in_function_from(declared_in_scope, parent, name) {
            let idx = self.functions[function.0 as usize].upvalues.len() as u32;
            self.functions[function.0 as usize].upvalues.push(UpvalueDescriptor {
                name,
                is_local: true,
                binding,
                parent_upvalue_index: None,
            });
            return Some(idx);
        }
        let parent_index = self.resolve_upvalue_chain(parent, name)?;
        let parent_binding = self.functions[parent.0 as usize].upvalues[parent_index as usize].binding;
        let idx = self.functions[function.0 as usize].upvalues.len() as u32;
        self.functions[function.0 as usize].upvalues.push(UpvalueDescriptor {
            name,
            is_local: false,
            binding: parent_binding,
            parent_upvalue_index: Some(parent_index),
        });
        Some(idx)
    }

    /// Resolves `name` as an assignment target: like
    /// [`resolve_variable_or_upvalue`](Self::resolve_variable_or_upvalue),
    /// but rejects assignment to an immutable binding.
    pub fn resolve_assignment_target(&mut self, name: Symbol) -> Result<Resolution, SymbolError> {
        let resolution = self.resolve_variable_or_upvalue(name)?;
        let binding = &self.bindings[resolution.binding().0 as usize];
        if !binding.mutable {
            let err = SymbolError::ImmutableAssign { name, decl_line: binding.decl_line };
            self.errors.push(err.clone());
            return Err(err);
        }
        Ok(resolution)
    }

    /// Resolves `name` for assignment, and if it isn't declared anywhere
    /// yet, declares it fresh. A fresh declaration made while inside a loop
    /// (branch depth > 0) is hoisted to the nearest enclosing function
    /// scope as a mutable binding, so it survives past the loop body that
    /// introduced it rather than dying with a per-iteration block scope.
    pub fn declare_or_hoist(&mut self, name: Symbol, line: u32) -> Resolution {
        if let Ok(resolution) = self.resolve_variable_or_upvalue(name) {
            return resolution;
        }
        self.errors.pop();
        let current_scope = *self.scope_stack.last().expect("scope stack empty");
        let target_scope = if self.scopes[current_scope.0 as usize].branch_depth > 0 {
            self.nearest_function_scope(current_scope)
        } else {
            current_scope
        };
        Resolution::Local(self.declare_in_scope(target_scope, name, BindingKind::Local, true, line))
    }

    fn nearest_function_scope(&self, scope: ScopeId) -> ScopeId {
        let mut cur = scope;
        loop {
            let rec = &self.scopes[cur.0 as usize];
            if rec.kind == ScopeKind::Function {
                return cur;
            }
            match rec.parent {
                Some(p) => cur = p,
                None => return cur,
            }
        }
    }

    /// A binding's full record.
    #[must_use]
    pub fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id.0 as usize]
    }

    /// The upvalue descriptors `function` needs at its `OP_CLOSURE_R`
    /// creation site, in capture order.
    #[must_use]
    pub fn upvalues_of(&self, function: FunctionId) -> &[UpvalueDescriptor] {
        &self.functions[function.0 as usize].upvalues
    }

    /// The function currently being compiled.
    #[must_use]
    pub fn current_function(&self) -> FunctionId {
        *self.function_stack.last().expect("function stack empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names() -> (StrInterner, Symbol, Symbol) {
        let mut i = StrInterner::new();
        let x = i.intern("x");
        let y = i.intern("y");
        (i, x, y)
    }

    #[test]
    fn declares_and_resolves_in_the_same_function() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.declare(x, BindingKind::Local, false, 1).unwrap();
        let resolution = t.resolve_variable_or_upvalue(x).unwrap();
        assert!(matches!(resolution, Resolution::Local(_)));
    }

    #[test]
    fn redeclaration_in_same_scope_is_rejected() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.declare(x, BindingKind::Local, false, 1).unwrap();
        let err = t.declare(x, BindingKind::Local, false, 2).unwrap_err();
        assert_eq!(err, SymbolError::Redeclared { name: x, prior_line: 1 });
    }

    #[test]
    fn shadowing_in_a_nested_block_is_allowed() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.declare(x, BindingKind::Local, false, 1).unwrap();
        t.push_scope(ScopeKind::Block);
        let inner = t.declare(x, BindingKind::Local, false, 2).unwrap();
        let resolved = t.resolve_variable_or_upvalue(x).unwrap();
        assert_eq!(resolved.binding(), inner);
        t.pop_scope();
    }

    #[test]
    fn assignment_to_immutable_binding_is_rejected() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.declare(x, BindingKind::Local, false, 1).unwrap();
        let err = t.resolve_assignment_target(x).unwrap_err();
        assert!(matches!(err, SymbolError::ImmutableAssign { decl_line: 1, .. }));
    }

    #[test]
    fn nested_function_captures_an_enclosing_local_as_an_upvalue() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.declare(x, BindingKind::Local, true, 1).unwrap();
        let inner = t.enter_function();
        let resolution = t.resolve_variable_or_upvalue(x).unwrap();
        match resolution {
            Resolution::Upvalue { index, .. } => {
                let up = &t.upvalues_of(inner)[index as usize];
                assert!(up.is_local);
            }
            Resolution::Local(_) => panic!("expected an upvalue capture"),
        }
        t.exit_function();
    }

    #[test]
    fn doubly_nested_function_chains_the_upvalue_through_the_middle_function() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.declare(x, BindingKind::Local, true, 1).unwrap();
        let middle = t.enter_function();
        let inner = t.enter_function();
        let resolution = t.resolve_variable_or_upvalue(x).unwrap();
        let Resolution::Upvalue { index: inner_index, .. } = resolution else {
            panic!("expected an upvalue capture");
        };
        let inner_up = &t.upvalues_of(inner)[inner_index as usize];
        assert!(!inner_up.is_local);
        let middle_idx = inner_up.parent_upvalue_index.unwrap();
        let middle_up = &t.upvalues_of(middle)[middle_idx as usize];
        assert!(middle_up.is_local);
        t.exit_function();
        t.exit_function();
    }

    #[test]
    fn unresolved_name_is_reported_and_recorded() {
        let (_i, _x, y) = names();
        let mut t = SymbolTable::new();
        let err = t.resolve_variable_or_upvalue(y).unwrap_err();
        assert_eq!(err, SymbolError::Unresolved { name: y });
        assert_eq!(t.errors.len(), 1);
    }

    #[test]
    fn assignment_inside_a_loop_hoists_a_fresh_binding_to_the_function_scope() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        t.push_scope(ScopeKind::Loop);
        let resolution = t.declare_or_hoist(x, 5);
        let hoisted = t.binding(resolution.binding());
        assert_eq!(hoisted.scope, ScopeId(0));
        assert!(hoisted.mutable);
        t.pop_scope();
        // still visible after the loop body that introduced it pops
        let resolved = t.resolve_variable_or_upvalue(x).unwrap();
        assert_eq!(resolved.binding(), resolution.binding());
    }

    #[test]
    fn assignment_outside_any_branch_declares_locally() {
        let (_i, x, _y) = names();
        let mut t = SymbolTable::new();
        let resolution = t.declare_or_hoist(x, 1);
        let binding = t.binding(resolution.binding());
        assert_eq!(binding.scope, ScopeId(0));
    }
}
