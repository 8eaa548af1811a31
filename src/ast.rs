use std::sync::Arc;

use crate::error::Position;
use crate::library::{Builtin, Library};
use crate::symbol_table::{ScopeId, SymbolId, SymbolKind, SymbolTable};
use crate::types::{NumericKind, TypeData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    IntegerDivide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    And,
    Or,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessOrEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterOrEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::IntegerDivide => "idiv",
            BinaryOperator::Modulo => "mod",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::Less => "<",
            BinaryOperator::LessOrEqual => "<=",
            BinaryOperator::Greater => ">",
            BinaryOperator::GreaterOrEqual => ">=",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Plus,
    Negate,
    Not,
    PreIncrement,
    PreDecrement,
    PostIncrement,
    PostDecrement,
}

impl UnaryOperator {
    pub fn mutates_operand(&self) -> bool {
        matches!(
            self,
            UnaryOperator::PreIncrement
                | UnaryOperator::PreDecrement
                | UnaryOperator::PostIncrement
                | UnaryOperator::PostDecrement
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    Normal,
    Stage,
}

/// How a stage reference participates in an assignment. A bare stage inside a
/// stage assignment means `<next>`, everywhere else `<now>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessContext {
    pub is_write_target: bool,
    pub is_stage_assignment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Function(SymbolId),
    Builtin(Builtin),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Invalid,
    Bool(bool),
    Integer {
        value: i64,
        kind: NumericKind,
    },
    Float(f64),
    Now,
    Next,
    Variable {
        symbol: SymbolId,
        context: AccessContext,
    },
    TimeSpecified {
        stage: SymbolId,
        time: Box<Expression>,
        context: AccessContext,
    },
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
    },
    Conversion {
        operand: Box<Expression>,
        target: TypeData,
    },
    Call {
        callee: Callee,
        arguments: Vec<Expression>,
    },
    Construct {
        structure: SymbolId,
        arguments: Vec<Expression>,
    },
    Index {
        target: Box<Expression>,
        indices: Vec<Expression>,
    },
    Field {
        target: Box<Expression>,
        field: String,
    },
    Assign {
        kind: AssignmentKind,
        target: Box<Expression>,
        value: Box<Expression>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub kind: ExprKind,
    pub position: Position,
}

impl Expression {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Self { kind, position }
    }

    pub fn invalid(position: Position) -> Self {
        Self::new(ExprKind::Invalid, position)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.kind, ExprKind::Invalid)
    }

    pub fn operands(&self) -> Vec<&Expression> {
        match &self.kind {
            ExprKind::Invalid
            | ExprKind::Bool(_)
            | ExprKind::Integer { .. }
            | ExprKind::Float(_)
            | ExprKind::Now
            | ExprKind::Next
            | ExprKind::Variable { .. } => Vec::new(),
            ExprKind::TimeSpecified { time, .. } => vec![time],
            ExprKind::Unary { operand, .. } | ExprKind::Conversion { operand, .. } => vec![operand],
            ExprKind::Binary { left, right, .. } => vec![left, right],
            ExprKind::Conditional {
                condition,
                if_true,
                if_false,
            } => vec![condition, if_true, if_false],
            ExprKind::Call { arguments, .. } | ExprKind::Construct { arguments, .. } => {
                arguments.iter().collect()
            }
            ExprKind::Index { target, indices } => {
                let mut operands: Vec<&Expression> = vec![target];
                operands.extend(indices.iter());
                operands
            }
            ExprKind::Field { target, .. } => vec![target],
            ExprKind::Assign { target, value, .. } => vec![target, value],
        }
    }

    /// The deduced type, or `None` while something it depends on is undecided.
    pub fn return_type(&self, table: &SymbolTable) -> Option<TypeData> {
        match &self.kind {
            ExprKind::Invalid => Some(TypeData::Invalid),
            ExprKind::Bool(_) => Some(TypeData::BOOL),
            ExprKind::Integer { kind, .. } => Some(TypeData::Numeric(*kind)),
            ExprKind::Float(_) => Some(TypeData::FLOAT64),
            ExprKind::Now | ExprKind::Next => Some(TypeData::INT32),
            ExprKind::Variable { symbol, .. } => {
                let symbol = table.symbol(*symbol);
                if symbol.is_variable() {
                    symbol.ty.clone()
                } else {
                    Some(TypeData::Invalid)
                }
            }
            ExprKind::TimeSpecified { stage, .. } => table.symbol(*stage).ty.clone(),
            ExprKind::Unary { op, operand } => match op {
                UnaryOperator::Not => Some(TypeData::BOOL),
                _ => operand.return_type(table),
            },
            ExprKind::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    return Some(TypeData::BOOL);
                }
                let left = left.return_type(table)?;
                let right = right.return_type(table)?;
                match (left.as_numeric(), right.as_numeric()) {
                    (Some(_), Some(_)) if *op == BinaryOperator::Divide => Some(TypeData::FLOAT64),
                    (Some(a), Some(b)) => Some(TypeData::Numeric(NumericKind::larger_of(a, b))),
                    _ => Some(TypeData::Invalid),
                }
            }
            ExprKind::Conditional { if_true, .. } => if_true.return_type(table),
            ExprKind::Conversion { target, .. } => Some(target.clone()),
            ExprKind::Call { callee, .. } => match callee {
                Callee::Function(id) => table.symbol(*id).ty.clone(),
                Callee::Builtin(builtin) => Some(builtin.return_type()),
            },
            ExprKind::Construct { structure, .. } => table.symbol(*structure).ty.clone(),
            ExprKind::Index { target, indices } => {
                let target = target.return_type(table)?;
                Some(
                    target
                        .element_after(indices.len())
                        .filter(|_| target.supports_indexing())
                        .cloned()
                        .unwrap_or(TypeData::Invalid),
                )
            }
            ExprKind::Field { target, field } => match target.return_type(table)? {
                TypeData::Struct(structure) => match structure.field(table, field) {
                    Some((_, id)) => table.symbol(id).ty.clone(),
                    None => Some(TypeData::Invalid),
                },
                _ => Some(TypeData::Invalid),
            },
            ExprKind::Assign { target, .. } => target.return_type(table),
        }
    }

    pub fn is_constant(&self, table: &SymbolTable) -> bool {
        self.is_constant_guarded(table, &mut Vec::new())
    }

    fn is_constant_guarded(&self, table: &SymbolTable, visiting: &mut Vec<SymbolId>) -> bool {
        match &self.kind {
            ExprKind::Bool(_) | ExprKind::Integer { .. } | ExprKind::Float(_) => true,
            ExprKind::Invalid
            | ExprKind::Now
            | ExprKind::Next
            | ExprKind::TimeSpecified { .. }
            | ExprKind::Call { .. }
            | ExprKind::Construct { .. }
            | ExprKind::Assign { .. } => false,
            ExprKind::Variable { symbol, .. } => {
                if visiting.contains(symbol) {
                    return false;
                }
                match &table.symbol(*symbol).kind {
                    SymbolKind::Parameter { body: None } => true,
                    SymbolKind::Parameter {
                        body: Some(Body::Expression(expression)),
                    } => {
                        visiting.push(*symbol);
                        let constant = expression.is_constant_guarded(table, visiting);
                        visiting.pop();
                        constant
                    }
                    _ => false,
                }
            }
            ExprKind::Unary { op, operand } => {
                !op.mutates_operand() && operand.is_constant_guarded(table, visiting)
            }
            _ => self
                .operands()
                .into_iter()
                .all(|operand| operand.is_constant_guarded(table, visiting)),
        }
    }

    /// Whether this expression denotes a storage location.
    pub fn is_place(&self) -> bool {
        match &self.kind {
            ExprKind::Variable { .. } | ExprKind::TimeSpecified { .. } => true,
            ExprKind::Index { target, .. } | ExprKind::Field { target, .. } => target.is_place(),
            _ => false,
        }
    }

    /// The variable at the root of a place expression.
    pub fn root_symbol(&self) -> Option<SymbolId> {
        match &self.kind {
            ExprKind::Variable { symbol, .. } => Some(*symbol),
            ExprKind::TimeSpecified { stage, .. } => Some(*stage),
            ExprKind::Index { target, .. } | ExprKind::Field { target, .. } => target.root_symbol(),
            _ => None,
        }
    }

    /// Whether the root is a stage reference without an explicit time.
    pub fn has_bare_stage_root(&self, table: &SymbolTable) -> bool {
        match &self.kind {
            ExprKind::Variable { symbol, .. } => table.symbol(*symbol).is_stage(),
            ExprKind::Index { target, .. } | ExprKind::Field { target, .. } => {
                target.has_bare_stage_root(table)
            }
            _ => false,
        }
    }

    /// Records the assignment context on the root reference of a place.
    pub fn mark_assignment_target(&mut self, kind: AssignmentKind) {
        match &mut self.kind {
            ExprKind::Variable { context, .. } | ExprKind::TimeSpecified { context, .. } => {
                context.is_write_target = true;
                context.is_stage_assignment = kind == AssignmentKind::Stage;
            }
            ExprKind::Index { target, .. } | ExprKind::Field { target, .. } => {
                target.mark_assignment_target(kind)
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub scope: ScopeId,
    pub statements: Vec<Statement>,
}

impl Block {
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            statements: Vec::new(),
        }
    }
}

/// A routine body: `= EXPR;` or `{ STMTS }`.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Expression(Expression),
    Block(Block),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Invalid,
    Block(Block),
    If {
        condition: Expression,
        then_branch: Block,
        else_branch: Option<Box<Statement>>,
    },
    While {
        condition: Expression,
        body: Block,
    },
    For {
        index: SymbolId,
        from: Expression,
        to: Expression,
        body: Block,
        parallel: bool,
    },
    EachAt {
        indices: Vec<SymbolId>,
        target: Expression,
        body: Block,
        parallel: bool,
    },
    VarDecl {
        symbol: SymbolId,
    },
    Return(Option<Expression>),
    Break,
    /// `ends_iteration` marks a `continue` whose innermost loop is a parallel
    /// fan-out; it lowers to leaving the iteration body.
    Continue {
        ends_iteration: bool,
    },
    Expression(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StmtKind,
    pub position: Position,
}

impl Statement {
    pub fn new(kind: StmtKind, position: Position) -> Self {
        Self { kind, position }
    }

    pub fn invalid(position: Position) -> Self {
        Self::new(StmtKind::Invalid, position)
    }
}

pub const INITIALIZATION_NAME: &str = "init";
pub const OPERATION_NAME: &str = "operation";

/// A parsed compile unit: the global scope with everything declared in it,
/// plus the external units linked for name resolution.
#[derive(Debug, Clone)]
pub struct ProgramUnit {
    pub table: SymbolTable,
    pub linked_units: Vec<Arc<Library>>,
}

impl ProgramUnit {
    pub fn new(table: SymbolTable, linked_units: Vec<Arc<Library>>) -> Self {
        Self {
            table,
            linked_units,
        }
    }

    /// Looks a name up in the linked units, in link order.
    pub fn resolve_external(&self, name: &str) -> Option<Builtin> {
        self.linked_units.iter().find_map(|unit| unit.lookup(name))
    }

    fn globals_where(&self, predicate: impl Fn(&SymbolKind) -> bool) -> Vec<SymbolId> {
        self.table
            .global_symbols()
            .filter(|id| predicate(&self.table.symbol(*id).kind))
            .collect()
    }

    pub fn stages(&self) -> Vec<SymbolId> {
        self.globals_where(|kind| matches!(kind, SymbolKind::Stage { .. }))
    }

    pub fn parameters(&self) -> Vec<SymbolId> {
        self.globals_where(|kind| matches!(kind, SymbolKind::Parameter { .. }))
    }

    pub fn functions(&self) -> Vec<SymbolId> {
        self.globals_where(|kind| matches!(kind, SymbolKind::Function { .. }))
    }

    pub fn structs(&self) -> Vec<SymbolId> {
        self.globals_where(|kind| matches!(kind, SymbolKind::Struct { .. }))
    }

    pub fn initialization(&self) -> Option<SymbolId> {
        self.table.lookup_global(INITIALIZATION_NAME)
    }

    pub fn operation(&self) -> Option<SymbolId> {
        self.table.lookup_global(OPERATION_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol_table::Symbol;

    fn at() -> Position {
        Position::new(0, 0)
    }

    fn int(value: i64) -> Expression {
        Expression::new(
            ExprKind::Integer {
                value,
                kind: NumericKind::Int32,
            },
            at(),
        )
    }

    fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Expression {
        Expression::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            at(),
        )
    }

    #[test]
    fn test_arithmetic_return_types() {
        let table = SymbolTable::new();
        let float = Expression::new(ExprKind::Float(1.5), at());

        let sum = binary(BinaryOperator::Add, int(1), float.clone());
        assert_eq!(sum.return_type(&table), Some(TypeData::FLOAT64));

        let quotient = binary(BinaryOperator::Divide, int(3), int(7));
        assert_eq!(quotient.return_type(&table), Some(TypeData::FLOAT64));

        let int_quotient = binary(BinaryOperator::IntegerDivide, int(3), int(7));
        assert_eq!(int_quotient.return_type(&table), Some(TypeData::INT32));

        let comparison = binary(BinaryOperator::Less, int(1), float);
        assert_eq!(comparison.return_type(&table), Some(TypeData::BOOL));
    }

    #[test]
    fn test_undecided_operand_propagates() {
        let mut table = SymbolTable::new();
        let id = table
            .define(Symbol::new(
                "p",
                SymbolKind::Parameter {
                    body: Some(Body::Expression(int(1))),
                },
                None,
                at(),
            ))
            .unwrap();
        let reference = Expression::new(
            ExprKind::Variable {
                symbol: id,
                context: AccessContext::default(),
            },
            at(),
        );
        let sum = binary(BinaryOperator::Add, reference, int(2));
        assert_eq!(sum.return_type(&table), None);
        assert!(sum.is_constant(&table));
    }

    #[test]
    fn test_constness() {
        let table = SymbolTable::new();
        assert!(binary(BinaryOperator::Multiply, int(2), int(3)).is_constant(&table));
        assert!(!Expression::new(ExprKind::Now, at()).is_constant(&table));
        assert!(!binary(BinaryOperator::Add, Expression::new(ExprKind::Now, at()), int(1)).is_constant(&table));
    }

    #[test]
    fn test_self_referencing_parameter_is_not_constant() {
        let mut table = SymbolTable::new();
        let id = table
            .define(Symbol::new("p", SymbolKind::Parameter { body: None }, None, at()))
            .unwrap();
        let reference = Expression::new(
            ExprKind::Variable {
                symbol: id,
                context: AccessContext::default(),
            },
            at(),
        );
        table.symbol_mut(id).kind = SymbolKind::Parameter {
            body: Some(Body::Expression(reference.clone())),
        };
        assert!(!reference.is_constant(&table));
    }

    #[test]
    fn test_mark_assignment_target_reaches_root() {
        let mut target = Expression::new(
            ExprKind::Index {
                target: Box::new(Expression::new(
                    ExprKind::Variable {
                        symbol: 0,
                        context: AccessContext::default(),
                    },
                    at(),
                )),
                indices: vec![int(0)],
            },
            at(),
        );
        target.mark_assignment_target(AssignmentKind::Stage);
        let ExprKind::Index { target: root, .. } = &target.kind else {
            panic!("Expected index expression");
        };
        assert!(matches!(
            root.kind,
            ExprKind::Variable {
                context: AccessContext {
                    is_write_target: true,
                    is_stage_assignment: true
                },
                ..
            }
        ));
        assert!(target.is_place());
        assert_eq!(target.root_symbol(), Some(0));
    }
}
