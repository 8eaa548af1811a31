//! Fixed-point type inference and post-inference validation.

use tracing::debug;

use crate::ast::{BinaryOperator, Block, Body, Callee, ExprKind, Expression, ProgramUnit, Statement, StmtKind, UnaryOperator};
use crate::error::{DiagnosticKind, Diagnostics, Position};
use crate::library::ParamSpec;
use crate::symbol_table::{SymbolId, SymbolKind, SymbolTable};
use crate::types::{ArrayType, NumericKind, TypeData};

/// Outcome of the inference loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceReport {
    pub passes: usize,
    pub unresolved: usize,
}

/// Inferred locals are approximate reals: numeric kinds widen to at least `float`.
fn widen_local(ty: TypeData) -> TypeData {
    match ty {
        TypeData::Numeric(kind) => TypeData::Numeric(NumericKind::larger_of(kind, NumericKind::Float64)),
        other => other,
    }
}

fn type_of(table: &SymbolTable, expression: &Expression) -> TypeData {
    expression.return_type(table).unwrap_or(TypeData::Invalid)
}

pub struct TypeChecker {
    diagnostics: Diagnostics,
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeChecker {
    pub fn new() -> Self {
        Self {
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn check_program(mut self, unit: &mut ProgramUnit) -> (InferenceReport, Diagnostics) {
        let report = self.infer_types(&mut unit.table);
        self.validate(&unit.table);
        self.report_unused_locals(&unit.table);
        (report, self.diagnostics)
    }

    /// Assigns a type to every inferable symbol. Each pass walks the whole
    /// symbol arena; the loop stops once nothing is undecided, or when a pass
    /// decides nothing new, in which case the remaining symbols are errors.
    pub fn infer_types(&mut self, table: &mut SymbolTable) -> InferenceReport {
        let mut passes = 0;

        loop {
            passes += 1;
            let mut undecided = Vec::new();
            let mut progress = false;

            for id in table.symbol_ids() {
                if table.symbol(id).ty.is_some() {
                    continue;
                }
                match Self::infer_symbol(table, id) {
                    Some(ty) => {
                        table.symbol_mut(id).ty = Some(ty);
                        progress = true;
                    }
                    None => undecided.push(id),
                }
            }

            debug!(pass = passes, undecided = undecided.len(), "inference pass finished");

            if undecided.is_empty() {
                return InferenceReport {
                    passes,
                    unresolved: 0,
                };
            }

            if !progress {
                for id in &undecided {
                    let symbol = table.symbol(*id);
                    let message = format!(
                        "cannot infer the type of {} '{}'",
                        symbol.kind_name(),
                        symbol.name
                    );
                    self.diagnostics
                        .error(DiagnosticKind::Type, symbol.declared_at, message);
                    table.symbol_mut(*id).ty = Some(TypeData::Invalid);
                }
                return InferenceReport {
                    passes,
                    unresolved: undecided.len(),
                };
            }
        }
    }

    fn infer_symbol(table: &SymbolTable, id: SymbolId) -> Option<TypeData> {
        match &table.symbol(id).kind {
            SymbolKind::Parameter {
                body: Some(Body::Expression(expression)),
            }
            | SymbolKind::Function {
                body: Some(Body::Expression(expression)),
                ..
            } => expression.return_type(table),
            SymbolKind::LocalVariable {
                initializer: Some(initializer),
                ..
            } => initializer.return_type(table).map(widen_local),
            _ => Some(TypeData::Invalid),
        }
    }

    // Validation

    fn error(&mut self, position: Position, message: impl Into<String>) {
        self.diagnostics.error(DiagnosticKind::Type, position, message);
    }

    pub fn validate(&mut self, table: &SymbolTable) {
        let globals: Vec<SymbolId> = table.global_symbols().collect();

        for id in globals {
            let symbol = table.symbol(id);
            let ty = symbol.ty.clone().unwrap_or(TypeData::Invalid);
            match &symbol.kind {
                SymbolKind::Stage { .. } => {
                    if let TypeData::Array(array) = &ty {
                        self.check_dimensions(table, array);
                    }
                }
                SymbolKind::Parameter { body } | SymbolKind::Function { body, .. } => {
                    if let SymbolKind::Function { params, .. } = &symbol.kind {
                        for param in params {
                            if let Some(TypeData::Array(array)) = &table.symbol(*param).ty {
                                self.check_dimensions(table, array);
                            }
                        }
                    }
                    match body {
                        Some(Body::Expression(expression)) => {
                            self.check_expression(table, expression);
                            self.check_conversion(table, expression, &ty, "value");
                        }
                        Some(Body::Block(block)) => self.check_block(table, block, &ty),
                        None => {}
                    }
                }
                SymbolKind::Struct { .. } => self.check_struct_nesting(table, id),
                SymbolKind::Operation { body: Some(block) }
                | SymbolKind::Initialization { body: Some(block) } => {
                    self.check_block(table, block, &TypeData::Nothing)
                }
                _ => {}
            }
        }
    }

    fn check_dimensions(&mut self, table: &SymbolTable, array: &ArrayType) {
        for size in array.dimensions().into_iter().flatten() {
            self.check_expression(table, size);
            self.require_integral(table, size, "array size");
        }
    }

    /// A struct may not contain itself, directly or through other structs.
    fn check_struct_nesting(&mut self, table: &SymbolTable, id: SymbolId) {
        let mut pending = vec![id];
        let mut seen = Vec::new();

        while let Some(current) = pending.pop() {
            for field in table.struct_fields(current) {
                if let Some(TypeData::Struct(inner)) = &table.symbol(*field).ty {
                    if inner.symbol == id {
                        let symbol = table.symbol(id);
                        let message = format!("struct '{}' contains itself", symbol.name);
                        self.error(symbol.declared_at, message);
                        return;
                    }
                    if !seen.contains(&inner.symbol) {
                        seen.push(inner.symbol);
                        pending.push(inner.symbol);
                    }
                }
            }
        }
    }

    fn check_block(&mut self, table: &SymbolTable, block: &Block, return_type: &TypeData) {
        for statement in &block.statements {
            self.check_statement(table, statement, return_type);
        }
    }

    fn check_statement(&mut self, table: &SymbolTable, statement: &Statement, return_type: &TypeData) {
        match &statement.kind {
            StmtKind::Invalid | StmtKind::Break | StmtKind::Continue { .. } => {}
            StmtKind::Block(block) => self.check_block(table, block, return_type),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.check_expression(table, condition);
                self.require_bool(table, condition, "condition");
                self.check_block(table, then_branch, return_type);
                if let Some(else_branch) = else_branch {
                    self.check_statement(table, else_branch, return_type);
                }
            }
            StmtKind::While { condition, body } => {
                self.check_expression(table, condition);
                self.require_bool(table, condition, "condition");
                self.check_block(table, body, return_type);
            }
            StmtKind::For { from, to, body, .. } => {
                for bound in [from, to] {
                    self.check_expression(table, bound);
                    self.require_integral(table, bound, "loop bound");
                }
                self.check_block(table, body, return_type);
            }
            StmtKind::EachAt {
                indices,
                target,
                body,
                ..
            } => {
                self.check_expression(table, target);
                let ty = type_of(table, target);
                if !ty.is_invalid() {
                    if !ty.supports_indexing() {
                        self.error(
                            target.position,
                            format!("'each' needs an array, found {}", ty),
                        );
                    } else if indices.len() > ty.rank() {
                        self.error(
                            target.position,
                            format!(
                                "'each' has {} indices but the array has rank {}",
                                indices.len(),
                                ty.rank()
                            ),
                        );
                    }
                }
                self.check_block(table, body, return_type);
            }
            StmtKind::VarDecl { symbol } => {
                let local = table.symbol(*symbol);
                if let SymbolKind::LocalVariable {
                    initializer: Some(initializer),
                    ..
                } = &local.kind
                {
                    self.check_expression(table, initializer);
                    let ty = local.ty.clone().unwrap_or(TypeData::Invalid);
                    self.check_conversion(table, initializer, &ty, "initializer");
                }
            }
            StmtKind::Return(None) => {
                if !return_type.is_nothing() && !return_type.is_invalid() {
                    self.error(
                        statement.position,
                        format!("missing return value of type {}", return_type),
                    );
                }
            }
            StmtKind::Return(Some(value)) => {
                self.check_expression(table, value);
                if return_type.is_nothing() {
                    self.error(statement.position, "cannot return a value here");
                } else {
                    self.check_conversion(table, value, return_type, "return value");
                }
            }
            StmtKind::Expression(expression) => self.check_expression(table, expression),
        }
    }

    fn check_expression(&mut self, table: &SymbolTable, expression: &Expression) {
        for operand in expression.operands() {
            self.check_expression(table, operand);
        }

        let position = expression.position;
        match &expression.kind {
            ExprKind::TimeSpecified { time, .. } => self.require_integral(table, time, "time"),
            ExprKind::Unary { op, operand } => {
                if *op == UnaryOperator::Not {
                    self.require_bool(table, operand, "operand of 'not'");
                } else {
                    self.require_numeric(table, operand, "operand");
                }
            }
            ExprKind::Binary { op, left, right } => {
                let what = format!("operand of '{}'", op.symbol());
                for operand in [left, right] {
                    match op {
                        BinaryOperator::And | BinaryOperator::Or => {
                            self.require_bool(table, operand, &what)
                        }
                        BinaryOperator::IntegerDivide | BinaryOperator::Modulo => {
                            self.require_integral(table, operand, &what)
                        }
                        _ => self.require_numeric(table, operand, &what),
                    }
                }
            }
            ExprKind::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                self.require_bool(table, condition, "condition");
                let ty = type_of(table, if_true);
                self.check_conversion(table, if_false, &ty, "conditional branch");
            }
            ExprKind::Conversion { operand, target } => {
                let from = type_of(table, operand);
                let convertible = from.is_invalid()
                    || target.is_invalid()
                    || (from.is_numeric() && target.is_numeric())
                    || from == *target;
                if !convertible {
                    self.error(position, format!("cannot convert {} to {}", from, target));
                }
            }
            ExprKind::Call { callee, arguments } => match callee {
                Callee::Function(id) => {
                    let function = table.symbol(*id);
                    let SymbolKind::Function { params, .. } = &function.kind else {
                        unreachable!("call target '{}' is not a function", function.name);
                    };
                    if self.check_argument_count(position, &function.name, params.len(), arguments.len()) {
                        for (argument, param) in arguments.iter().zip(params) {
                            let ty = table.symbol(*param).ty.clone().unwrap_or(TypeData::Invalid);
                            self.check_conversion(table, argument, &ty, "argument");
                        }
                    }
                }
                Callee::Builtin(builtin) => {
                    let params = builtin.params();
                    if self.check_argument_count(position, builtin.name(), params.len(), arguments.len()) {
                        for (argument, spec) in arguments.iter().zip(params) {
                            match spec {
                                ParamSpec::Numeric(kind) => self.check_conversion(
                                    table,
                                    argument,
                                    &TypeData::Numeric(*kind),
                                    "argument",
                                ),
                                ParamSpec::Any => {
                                    if type_of(table, argument).is_nothing() {
                                        self.error(argument.position, "argument has no value");
                                    }
                                }
                            }
                        }
                    }
                }
            },
            ExprKind::Construct {
                structure,
                arguments,
            } => {
                let name = &table.symbol(*structure).name;
                let fields = table.struct_fields(*structure);
                if self.check_argument_count(position, name, fields.len(), arguments.len()) {
                    for (argument, field) in arguments.iter().zip(fields) {
                        let ty = table.symbol(*field).ty.clone().unwrap_or(TypeData::Invalid);
                        self.check_conversion(table, argument, &ty, "field value");
                    }
                }
            }
            ExprKind::Index { target, indices } => {
                let ty = type_of(table, target);
                if !ty.is_invalid() {
                    if !ty.supports_indexing() {
                        self.error(position, format!("cannot index a value of type {}", ty));
                    } else if indices.len() > ty.rank() {
                        self.error(
                            position,
                            format!(
                                "too many indices: {} given for {} of rank {}",
                                indices.len(),
                                ty,
                                ty.rank()
                            ),
                        );
                    }
                }
                for index in indices {
                    self.require_integral(table, index, "index");
                }
            }
            ExprKind::Field { target, field } => match type_of(table, target) {
                TypeData::Invalid => {}
                TypeData::Struct(structure) => {
                    if structure.field(table, field).is_none() {
                        self.error(
                            position,
                            format!("struct '{}' has no field '{}'", structure.name, field),
                        );
                    }
                }
                other => self.error(
                    position,
                    format!("cannot access field '{}' of a value of type {}", field, other),
                ),
            },
            ExprKind::Assign { target, value, .. } => {
                let ty = type_of(table, target);
                self.check_conversion(table, value, &ty, "assigned value");
            }
            _ => {}
        }
    }

    fn check_argument_count(&mut self, position: Position, name: &str, expected: usize, found: usize) -> bool {
        if expected == found {
            return true;
        }
        self.error(
            position,
            format!("'{}' takes {} argument(s), found {}", name, expected, found),
        );
        false
    }

    /// Implicit conversions may only widen.
    fn check_conversion(&mut self, table: &SymbolTable, value: &Expression, target: &TypeData, what: &str) {
        let ty = type_of(table, value);
        if !ty.converts_implicitly_to(target) {
            self.error(
                value.position,
                format!("{} of type {} does not convert implicitly to {}", what, ty, target),
            );
        }
    }

    fn require_numeric(&mut self, table: &SymbolTable, expression: &Expression, what: &str) {
        let ty = type_of(table, expression);
        if !ty.is_invalid() && !ty.is_numeric() {
            self.error(expression.position, format!("{} must be numeric, found {}", what, ty));
        }
    }

    fn require_integral(&mut self, table: &SymbolTable, expression: &Expression, what: &str) {
        let ty = type_of(table, expression);
        if !ty.is_invalid() && !(ty.is_integral() && !ty.is_bool()) {
            self.error(expression.position, format!("{} must be an integer, found {}", what, ty));
        }
    }

    fn require_bool(&mut self, table: &SymbolTable, expression: &Expression, what: &str) {
        let ty = type_of(table, expression);
        if !ty.is_invalid() && !ty.is_bool() {
            self.error(expression.position, format!("{} must be bool, found {}", what, ty));
        }
    }

    fn report_unused_locals(&mut self, table: &SymbolTable) {
        for id in table.unused_locals() {
            let symbol = table.symbol(id);
            self.diagnostics.warning(
                DiagnosticKind::Name,
                symbol.declared_at,
                format!("local variable '{}' is never used", symbol.name),
            );
        }
    }
}
