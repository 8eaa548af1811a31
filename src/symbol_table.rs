use indexmap::IndexMap;
use thiserror::Error;

use crate::ast::{Block, Body, Expression};
use crate::error::Position;
use crate::hold_state::HoldState;
use crate::types::TypeData;

pub type ScopeId = usize;
pub type SymbolId = usize;

#[derive(Debug, Clone)]
pub enum SymbolKind {
    Stage {
        hold: HoldState,
    },
    /// External when `body` is absent.
    Parameter {
        body: Option<Body>,
    },
    LocalVariable {
        initializer: Option<Expression>,
        unique_no: usize,
    },
    FunctionParameter,
    Function {
        params: Vec<SymbolId>,
        body: Option<Body>,
        scope: Option<ScopeId>,
    },
    Struct {
        fields: Vec<SymbolId>,
    },
    Field,
    Operation {
        body: Option<Block>,
    },
    Initialization {
        body: Option<Block>,
    },
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// `None` until declared or inferred.
    pub ty: Option<TypeData>,
    pub scope_id: ScopeId,
    pub declared_at: Position,
    pub used: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, ty: Option<TypeData>, declared_at: Position) -> Self {
        Self {
            name: name.into(),
            kind,
            ty,
            scope_id: 0,
            declared_at,
            used: false,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::Stage { .. }
                | SymbolKind::Parameter { .. }
                | SymbolKind::LocalVariable { .. }
                | SymbolKind::FunctionParameter
        )
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::LocalVariable { .. } | SymbolKind::FunctionParameter
        )
    }

    pub fn is_stage(&self) -> bool {
        matches!(self.kind, SymbolKind::Stage { .. })
    }

    pub fn is_external_parameter(&self) -> bool {
        matches!(self.kind, SymbolKind::Parameter { body: None })
    }

    pub fn hold_state(&self) -> Option<HoldState> {
        match &self.kind {
            SymbolKind::Stage { hold } => Some(*hold),
            _ => None,
        }
    }

    /// Name used in lowered listings; locals may carry their unique number.
    pub fn display_name(&self, add_unique_no: bool) -> String {
        match &self.kind {
            SymbolKind::LocalVariable { unique_no, .. } if add_unique_no => {
                format!("{}_{}", self.name, unique_no)
            }
            _ => self.name.clone(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SymbolKind::Stage { .. } => "stage",
            SymbolKind::Parameter { .. } => "parameter",
            SymbolKind::LocalVariable { .. } => "local variable",
            SymbolKind::FunctionParameter => "function parameter",
            SymbolKind::Function { .. } => "function",
            SymbolKind::Struct { .. } => "struct",
            SymbolKind::Field => "field",
            SymbolKind::Operation { .. } => "operation",
            SymbolKind::Initialization { .. } => "init",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScopeKind {
    Global,
    Function { name: String },
    Parameter { name: String },
    Struct { name: String },
    Operation,
    Initialization,
    Block,
    While,
    For { parallel: bool },
    Each { parallel: bool, indices: usize },
}

impl ScopeKind {
    fn is_loop(&self) -> bool {
        matches!(self, ScopeKind::While | ScopeKind::For { .. } | ScopeKind::Each { .. })
    }

    fn is_parallel_loop(&self) -> bool {
        matches!(
            self,
            ScopeKind::For { parallel: true } | ScopeKind::Each { parallel: true, .. }
        )
    }

    /// Top-level bodies; loop lookups stop here.
    fn is_routine(&self) -> bool {
        matches!(
            self,
            ScopeKind::Global
                | ScopeKind::Function { .. }
                | ScopeKind::Parameter { .. }
                | ScopeKind::Struct { .. }
                | ScopeKind::Operation
                | ScopeKind::Initialization
        )
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub symbols: IndexMap<String, SymbolId>,
    pub depth: usize,
}

impl Scope {
    pub fn new(id: ScopeId, kind: ScopeKind, parent: Option<ScopeId>, depth: usize) -> Self {
        Self {
            id,
            kind,
            parent,
            children: Vec::new(),
            symbols: IndexMap::new(),
            depth,
        }
    }

    pub fn get_symbol(&self, name: &str) -> Option<SymbolId> {
        self.symbols.get(name).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("'{name}' is already declared in this scope")]
pub struct DuplicateSymbol {
    pub name: String,
    pub existing: SymbolId,
}

/// Arena of scopes and symbols for one compile. Cross references are indices.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
    current_scope: ScopeId,
    global_scope: ScopeId,
    next_unique_no: usize,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(0, ScopeKind::Global, None, 0)],
            symbols: Vec::new(),
            current_scope: 0,
            global_scope: 0,
            next_unique_no: 0,
        }
    }

    pub fn enter_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let scope_id = self.scopes.len();
        let depth = self.scopes[self.current_scope].depth + 1;

        self.scopes
            .push(Scope::new(scope_id, kind, Some(self.current_scope), depth));
        self.scopes[self.current_scope].children.push(scope_id);

        self.current_scope = scope_id;
        scope_id
    }

    pub fn exit_scope(&mut self) -> ScopeId {
        match self.scopes[self.current_scope].parent {
            Some(parent) => {
                self.current_scope = parent;
                parent
            }
            None => panic!("cannot exit the global scope"),
        }
    }

    pub fn current_scope(&self) -> ScopeId {
        self.current_scope
    }

    pub fn global_scope(&self) -> ScopeId {
        self.global_scope
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_ids(&self) -> std::ops::Range<SymbolId> {
        0..self.symbols.len()
    }

    /// Defines a symbol in the current scope.
    pub fn define(&mut self, symbol: Symbol) -> Result<SymbolId, DuplicateSymbol> {
        self.define_in(self.current_scope, symbol)
    }

    pub fn define_in(&mut self, scope_id: ScopeId, mut symbol: Symbol) -> Result<SymbolId, DuplicateSymbol> {
        if let Some(existing) = self.scopes[scope_id].get_symbol(&symbol.name) {
            return Err(DuplicateSymbol {
                name: symbol.name,
                existing,
            });
        }

        let symbol_id = self.symbols.len();
        symbol.scope_id = scope_id;
        self.scopes[scope_id]
            .symbols
            .insert(symbol.name.clone(), symbol_id);
        self.symbols.push(symbol);
        Ok(symbol_id)
    }

    /// Unique numbers disambiguate shadowed locals in lowered output.
    pub fn next_unique_no(&mut self) -> usize {
        let no = self.next_unique_no;
        self.next_unique_no += 1;
        no
    }

    /// Resolves a name from the current scope outwards.
    pub fn resolve(&self, name: &str) -> Option<SymbolId> {
        self.resolve_from(self.current_scope, name)
    }

    /// Function scopes skip straight to the global scope once their own
    /// parameters have been searched.
    pub fn resolve_from(&self, scope_id: ScopeId, name: &str) -> Option<SymbolId> {
        let mut current = Some(scope_id);

        while let Some(id) = current {
            let scope = &self.scopes[id];
            if let Some(symbol_id) = scope.get_symbol(name) {
                return Some(symbol_id);
            }
            current = match scope.kind {
                ScopeKind::Function { .. } => {
                    if id == self.global_scope {
                        None
                    } else {
                        Some(self.global_scope)
                    }
                }
                _ => scope.parent,
            };
        }

        None
    }

    pub fn lookup_current_scope(&self, name: &str) -> Option<SymbolId> {
        self.scopes[self.current_scope].get_symbol(name)
    }

    pub fn lookup_global(&self, name: &str) -> Option<SymbolId> {
        self.scopes[self.global_scope].get_symbol(name)
    }

    /// Symbols of a scope in declaration order.
    pub fn symbols_in(&self, scope_id: ScopeId) -> impl Iterator<Item = SymbolId> + '_ {
        self.scopes[scope_id].symbols.values().copied()
    }

    pub fn global_symbols(&self) -> impl Iterator<Item = SymbolId> + '_ {
        self.symbols_in(self.global_scope)
    }

    pub fn struct_fields(&self, id: SymbolId) -> &[SymbolId] {
        match &self.symbols[id].kind {
            SymbolKind::Struct { fields } => fields,
            _ => &[],
        }
    }

    /// Innermost enclosing loop of `scope_id` within the same routine.
    pub fn innermost_loop(&self, scope_id: ScopeId) -> Option<&ScopeKind> {
        self.enclosing_loops(scope_id).next()
    }

    pub fn is_inside_parallel_loop(&self, scope_id: ScopeId) -> bool {
        self.enclosing_loops(scope_id).any(ScopeKind::is_parallel_loop)
    }

    fn enclosing_loops(&self, scope_id: ScopeId) -> impl Iterator<Item = &ScopeKind> + '_ {
        let mut current = Some(scope_id);
        std::iter::from_fn(move || {
            while let Some(id) = current {
                let scope = &self.scopes[id];
                if scope.kind.is_routine() {
                    current = None;
                    return None;
                }
                current = scope.parent;
                if scope.kind.is_loop() {
                    return Some(&scope.kind);
                }
            }
            None
        })
    }

    pub fn mark_used(&mut self, symbol_id: SymbolId) {
        self.symbols[symbol_id].used = true;
    }

    /// Locals that are declared but never read (for warnings).
    pub fn unused_locals(&self) -> Vec<SymbolId> {
        self.symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.kind, SymbolKind::LocalVariable { initializer: Some(_), .. }) && !s.used)
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> Symbol {
        Symbol::new(
            name,
            SymbolKind::LocalVariable {
                initializer: None,
                unique_no: 0,
            },
            Some(TypeData::INT32),
            Position::new(0, 0),
        )
    }

    #[test]
    fn test_symbol_table_creation() {
        let symbol_table = SymbolTable::new();
        assert_eq!(symbol_table.current_scope(), 0);
        assert_eq!(symbol_table.global_scope(), 0);
        assert!(matches!(symbol_table.scope(0).kind, ScopeKind::Global));
        assert_eq!(symbol_table.symbol_count(), 0);
    }

    #[test]
    fn test_scope_management() {
        let mut symbol_table = SymbolTable::new();

        let func_scope = symbol_table.enter_scope(ScopeKind::Function {
            name: "f".to_string(),
        });
        assert_eq!(func_scope, 1);
        assert_eq!(symbol_table.current_scope(), 1);

        let block_scope = symbol_table.enter_scope(ScopeKind::Block);
        assert_eq!(block_scope, 2);
        assert_eq!(symbol_table.scope(block_scope).depth, 2);

        assert_eq!(symbol_table.exit_scope(), 1);
        assert_eq!(symbol_table.exit_scope(), 0);
        assert_eq!(symbol_table.scope(0).children, vec![1]);
    }

    #[test]
    fn test_duplicate_in_same_scope() {
        let mut symbol_table = SymbolTable::new();
        let first = symbol_table.define(local("x")).unwrap();

        let err = symbol_table.define(local("x")).unwrap_err();
        assert_eq!(err.name, "x");
        assert_eq!(err.existing, first);
        assert_eq!(err.to_string(), "'x' is already declared in this scope");
    }

    #[test]
    fn test_scope_shadowing() {
        let mut symbol_table = SymbolTable::new();
        let outer = symbol_table.define(local("x")).unwrap();

        symbol_table.enter_scope(ScopeKind::Block);
        let inner = symbol_table.define(local("x")).unwrap();
        assert_ne!(outer, inner);
        assert_eq!(symbol_table.resolve("x"), Some(inner));

        symbol_table.exit_scope();
        assert_eq!(symbol_table.resolve("x"), Some(outer));
    }

    #[test]
    fn test_function_scope_skips_to_global() {
        let mut symbol_table = SymbolTable::new();
        let global = symbol_table.define(local("g")).unwrap();

        // A block that a function scope is (incorrectly) nested in must stay invisible.
        symbol_table.enter_scope(ScopeKind::Operation);
        symbol_table.define(local("hidden")).unwrap();
        symbol_table.enter_scope(ScopeKind::Function {
            name: "f".to_string(),
        });
        let param = symbol_table.define(local("p")).unwrap();
        symbol_table.enter_scope(ScopeKind::Block);

        assert_eq!(symbol_table.resolve("p"), Some(param));
        assert_eq!(symbol_table.resolve("g"), Some(global));
        assert_eq!(symbol_table.resolve("hidden"), None);
    }

    #[test]
    fn test_loop_queries() {
        let mut symbol_table = SymbolTable::new();
        symbol_table.enter_scope(ScopeKind::Operation);
        let operation = symbol_table.current_scope();
        assert!(symbol_table.innermost_loop(operation).is_none());

        symbol_table.enter_scope(ScopeKind::For { parallel: true });
        symbol_table.enter_scope(ScopeKind::Block);
        let block = symbol_table.current_scope();
        assert_eq!(
            symbol_table.innermost_loop(block),
            Some(&ScopeKind::For { parallel: true })
        );
        assert!(symbol_table.is_inside_parallel_loop(block));

        symbol_table.enter_scope(ScopeKind::While);
        let inner = symbol_table.current_scope();
        assert_eq!(symbol_table.innermost_loop(inner), Some(&ScopeKind::While));
        assert!(symbol_table.is_inside_parallel_loop(inner));
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let mut symbol_table = SymbolTable::new();
        for name in ["c", "a", "b"] {
            symbol_table.define(local(name)).unwrap();
        }
        let names: Vec<&str> = symbol_table
            .global_symbols()
            .map(|id| symbol_table.symbol(id).name.as_str())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
