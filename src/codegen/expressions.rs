use crate::ast::{AccessContext, BinaryOperator, Callee, ExprKind, Expression, UnaryOperator};
use crate::library::ParamSpec;
use crate::runtime::{apply_binary, apply_unary};
use crate::symbol_table::{SymbolId, SymbolKind};
use crate::types::{NumericKind, TypeData};

use super::ir::{BinaryOp, LExpr, LPlace, UnaryOp};
use super::{Lowerer, ParameterMode};

/// `now + 1`.
pub(super) fn next_time() -> LExpr {
    LExpr::binary(BinaryOp::Add, LExpr::Now, LExpr::int32(1), NumericKind::Int32)
}

/// Folds one operator node whose operands are constants. Operands are
/// expected to be folded already; a fold that would fault at run time is
/// left in place.
pub fn fold_constants(expression: LExpr) -> LExpr {
    let folded = match &expression {
        LExpr::Binary {
            op,
            left,
            right,
            kind,
        } => match (left.as_const(), right.as_const()) {
            (Some(left), Some(right)) => apply_binary(*op, *kind, left, right).ok(),
            _ => None,
        },
        LExpr::Unary { op, operand, kind } => operand
            .as_const()
            .and_then(|value| apply_unary(*op, *kind, value).ok()),
        LExpr::Convert { operand, kind } => operand
            .as_const()
            .and_then(|value| value.convert(*kind).ok()),
        _ => None,
    };
    folded.map_or(expression, LExpr::Const)
}

fn binary_op(op: BinaryOperator) -> BinaryOp {
    match op {
        BinaryOperator::Add => BinaryOp::Add,
        BinaryOperator::Subtract => BinaryOp::Subtract,
        BinaryOperator::Multiply => BinaryOp::Multiply,
        BinaryOperator::Divide => BinaryOp::Divide,
        BinaryOperator::IntegerDivide => BinaryOp::IntegerDivide,
        BinaryOperator::Modulo => BinaryOp::Modulo,
        BinaryOperator::Equal => BinaryOp::Equal,
        BinaryOperator::NotEqual => BinaryOp::NotEqual,
        BinaryOperator::Less => BinaryOp::Less,
        BinaryOperator::LessOrEqual => BinaryOp::LessOrEqual,
        BinaryOperator::Greater => BinaryOp::Greater,
        BinaryOperator::GreaterOrEqual => BinaryOp::GreaterOrEqual,
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
    }
}

/// Which timestep of a stage an access addresses.
#[derive(Clone, Copy)]
enum StageTime<'e> {
    Now,
    Next,
    At(&'e Expression),
}

impl<'e> StageTime<'e> {
    fn of(time: &'e Expression) -> Self {
        match time.kind {
            ExprKind::Now => StageTime::Now,
            ExprKind::Next => StageTime::Next,
            _ => StageTime::At(time),
        }
    }

    /// A bare stage inside a stage assignment target is its `next` element.
    fn implicit(context: AccessContext) -> Self {
        if context.is_write_target && context.is_stage_assignment {
            StageTime::Next
        } else {
            StageTime::Now
        }
    }
}

impl Lowerer<'_> {
    fn finish(&self, expression: LExpr) -> LExpr {
        if self.options.optimize {
            fold_constants(expression)
        } else {
            expression
        }
    }

    pub(super) fn type_of(&self, expression: &Expression) -> TypeData {
        expression.return_type(self.table).unwrap_or(TypeData::Invalid)
    }

    fn numeric_kind(&self, expression: &Expression) -> NumericKind {
        match self.type_of(expression) {
            TypeData::Numeric(kind) => kind,
            other => unreachable!("expected a numeric operand, found {}", other),
        }
    }

    /// Lowers `expression` and widens it to `target` when both are numeric.
    pub(super) fn lower_as(&mut self, expression: &Expression, target: &TypeData) -> LExpr {
        match target.as_numeric() {
            Some(kind) => self.lower_as_kind(expression, kind),
            None => self.lower_expression(expression),
        }
    }

    pub(super) fn lower_as_kind(&mut self, expression: &Expression, kind: NumericKind) -> LExpr {
        let lowered = self.lower_expression(expression);
        match self.type_of(expression).as_numeric() {
            Some(from) if from != kind => self.finish(LExpr::convert(lowered, kind)),
            _ => lowered,
        }
    }

    pub(super) fn lower_expression(&mut self, expression: &Expression) -> LExpr {
        match &expression.kind {
            ExprKind::Invalid => unreachable!("invalid expression reached lowering"),
            ExprKind::Bool(value) => LExpr::Const(crate::runtime::Value::Bool(*value)),
            ExprKind::Integer { value, kind } => {
                LExpr::Const(crate::runtime::Value::from_i64(*kind, *value))
            }
            ExprKind::Float(value) => LExpr::Const(crate::runtime::Value::Float64(*value)),
            ExprKind::Now => LExpr::Now,
            ExprKind::Next => next_time(),
            ExprKind::Variable { symbol, context } => self.lower_variable(*symbol, *context),
            ExprKind::TimeSpecified { .. } => LExpr::Load(self.lower_place(expression)),
            ExprKind::Unary { op, operand } => self.lower_unary(*op, operand),
            ExprKind::Binary { op, left, right } => self.lower_binary(*op, left, right),
            ExprKind::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                let ty = self.type_of(expression);
                LExpr::Conditional {
                    condition: Box::new(self.lower_as(condition, &TypeData::BOOL)),
                    if_true: Box::new(self.lower_as(if_true, &ty)),
                    if_false: Box::new(self.lower_as(if_false, &ty)),
                }
            }
            ExprKind::Conversion { operand, target } => match target.as_numeric() {
                Some(kind) => {
                    let operand = self.lower_expression(operand);
                    self.finish(LExpr::convert(operand, kind))
                }
                None => self.lower_expression(operand),
            },
            ExprKind::Call { callee, arguments } => self.lower_call(*callee, arguments),
            ExprKind::Construct {
                structure,
                arguments,
            } => {
                let table = self.table;
                let fields = table.struct_fields(*structure);
                LExpr::Construct(
                    fields
                        .iter()
                        .zip(arguments)
                        .map(|(field, argument)| {
                            let ty = self.symbol_type(*field);
                            self.lower_as(argument, &ty)
                        })
                        .collect(),
                )
            }
            ExprKind::Index { target, indices } => {
                if self.is_storage(expression) {
                    return LExpr::Load(self.lower_place(expression));
                }
                let mut lowered = self.lower_expression(target);
                for index in indices {
                    lowered = LExpr::Index {
                        target: Box::new(lowered),
                        index: Box::new(self.lower_expression(index)),
                    };
                }
                lowered
            }
            ExprKind::Field { target, field } => {
                if self.is_storage(expression) {
                    return LExpr::Load(self.lower_place(expression));
                }
                let field = self.field_index(target, field);
                LExpr::Field {
                    target: Box::new(self.lower_expression(target)),
                    field,
                }
            }
            ExprKind::Assign { target, value, .. } => {
                let ty = self.type_of(target);
                let place = self.lower_place(target);
                LExpr::Assign {
                    place,
                    value: Box::new(self.lower_as(value, &ty)),
                }
            }
        }
    }

    fn lower_variable(&mut self, symbol: SymbolId, context: AccessContext) -> LExpr {
        let table = self.table;
        match &table.symbol(symbol).kind {
            SymbolKind::Stage { .. } => LExpr::Load(LPlace::Stage {
                stage: self.stages[&symbol],
                slot: Box::new(self.stage_slot(symbol, StageTime::implicit(context))),
            }),
            SymbolKind::Parameter { .. } => {
                let (id, mode) = self.parameters[&symbol];
                match mode {
                    ParameterMode::External | ParameterMode::Cached => LExpr::Parameter(id),
                    ParameterMode::Computed => LExpr::EvaluateParameter(id),
                }
            }
            SymbolKind::LocalVariable { .. } | SymbolKind::FunctionParameter => {
                LExpr::local(self.local_id(symbol))
            }
            _ => unreachable!("'{}' is not a variable", table.symbol(symbol).name),
        }
    }

    fn lower_unary(&mut self, op: UnaryOperator, operand: &Expression) -> LExpr {
        let (delta, prefix) = match op {
            UnaryOperator::Plus => return self.lower_expression(operand),
            UnaryOperator::Negate => {
                let kind = self.numeric_kind(operand);
                let operand = self.lower_expression(operand);
                return self.finish(LExpr::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(operand),
                    kind,
                });
            }
            UnaryOperator::Not => {
                let operand = self.lower_as_kind(operand, NumericKind::Bool);
                return self.finish(LExpr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                    kind: NumericKind::Bool,
                });
            }
            UnaryOperator::PreIncrement => (1, true),
            UnaryOperator::PreDecrement => (-1, true),
            UnaryOperator::PostIncrement => (1, false),
            UnaryOperator::PostDecrement => (-1, false),
        };
        LExpr::Increment {
            kind: self.numeric_kind(operand),
            place: self.lower_place(operand),
            delta,
            prefix,
        }
    }

    fn lower_binary(&mut self, op: BinaryOperator, left: &Expression, right: &Expression) -> LExpr {
        let kind = if op.is_logical() {
            NumericKind::Bool
        } else if op == BinaryOperator::Divide {
            NumericKind::Float64
        } else {
            NumericKind::larger_of(self.numeric_kind(left), self.numeric_kind(right))
        };
        let left = self.lower_as_kind(left, kind);
        let right = self.lower_as_kind(right, kind);
        self.finish(LExpr::binary(binary_op(op), left, right, kind))
    }

    fn lower_call(&mut self, callee: Callee, arguments: &[Expression]) -> LExpr {
        match callee {
            Callee::Function(symbol) => {
                let table = self.table;
                let SymbolKind::Function { params, .. } = &table.symbol(symbol).kind else {
                    unreachable!("'{}' is not a function", table.symbol(symbol).name);
                };
                let arguments = params
                    .iter()
                    .zip(arguments)
                    .map(|(param, argument)| {
                        let ty = self.symbol_type(*param);
                        self.lower_as(argument, &ty)
                    })
                    .collect();
                LExpr::Call {
                    function: self.functions[&symbol],
                    arguments,
                }
            }
            Callee::Builtin(builtin) => {
                let arguments = builtin
                    .params()
                    .iter()
                    .zip(arguments)
                    .map(|(spec, argument)| match spec {
                        ParamSpec::Any => self.lower_expression(argument),
                        ParamSpec::Numeric(kind) => self.lower_as_kind(argument, *kind),
                    })
                    .collect();
                LExpr::CallBuiltin { builtin, arguments }
            }
        }
    }

    /// Whether a place expression is rooted in writable storage rather than
    /// a parameter value.
    fn is_storage(&self, expression: &Expression) -> bool {
        expression.is_place()
            && expression.root_symbol().map_or(false, |root| {
                let symbol = self.table.symbol(root);
                symbol.is_local() || symbol.is_stage()
            })
    }

    fn field_index(&self, target: &Expression, name: &str) -> usize {
        match self.type_of(target) {
            TypeData::Struct(structure) => match structure.field(self.table, name) {
                Some((index, _)) => index,
                None => unreachable!("struct '{}' has no field '{}'", structure.name, name),
            },
            other => unreachable!("field access on {}", other),
        }
    }

    pub(super) fn lower_place(&mut self, expression: &Expression) -> LPlace {
        match &expression.kind {
            ExprKind::Variable { symbol, context } => {
                let table = self.table;
                match &table.symbol(*symbol).kind {
                    SymbolKind::Stage { .. } => LPlace::Stage {
                        stage: self.stages[symbol],
                        slot: Box::new(self.stage_slot(*symbol, StageTime::implicit(*context))),
                    },
                    SymbolKind::LocalVariable { .. } | SymbolKind::FunctionParameter => {
                        LPlace::Local(self.local_id(*symbol))
                    }
                    _ => unreachable!("'{}' is not assignable", table.symbol(*symbol).name),
                }
            }
            ExprKind::TimeSpecified { stage, time, .. } => LPlace::Stage {
                stage: self.stages[stage],
                slot: Box::new(self.stage_slot(*stage, StageTime::of(time))),
            },
            ExprKind::Index { target, indices } => {
                let mut place = self.lower_place(target);
                for index in indices {
                    place = LPlace::Index {
                        target: Box::new(place),
                        index: Box::new(self.lower_expression(index)),
                    };
                }
                place
            }
            ExprKind::Field { target, field } => {
                let field = self.field_index(target, field);
                LPlace::Field {
                    target: Box::new(self.lower_place(target)),
                    field,
                }
            }
            _ => unreachable!("expression is not a place"),
        }
    }

    /// The storage slot a stage access resolves to through the stage's hold state.
    fn stage_slot(&mut self, symbol: SymbolId, time: StageTime) -> LExpr {
        let stage = self.stages[&symbol];
        let cached = self.is_stage_cached(stage);
        let hold = self.stage_layouts[stage].hold;
        let slot = match time {
            StageTime::Now if cached => return LExpr::StageSlot { stage, next: false },
            StageTime::Next if cached => return LExpr::StageSlot { stage, next: true },
            StageTime::Now => hold.index_expr(LExpr::Now),
            StageTime::Next => hold.index_expr(next_time()),
            StageTime::At(time) => {
                let time = self.lower_as_kind(time, NumericKind::Int32);
                hold.index_expr(time)
            }
        };
        self.finish(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ir::{LStmt, ParameterSource};
    use super::super::tests::{lower_source, lower_source_with};
    use super::*;
    use crate::options::CompileOptions;
    use crate::runtime::Value;

    fn returned(source: &str) -> LExpr {
        let program = lower_source(source);
        match &program.functions[0].body[..] {
            [LStmt::Return(Some(value))] => value.clone(),
            other => panic!("Expected a single return, found {:?}", other),
        }
    }

    #[test]
    fn test_fold_constants() {
        let sum = LExpr::binary(BinaryOp::Add, LExpr::int32(2), LExpr::int32(3), NumericKind::Int32);
        assert_eq!(fold_constants(sum), LExpr::int32(5));

        let by_zero = LExpr::binary(
            BinaryOp::IntegerDivide,
            LExpr::int32(1),
            LExpr::int32(0),
            NumericKind::Int32,
        );
        assert!(matches!(fold_constants(by_zero), LExpr::Binary { .. }));

        let widened = LExpr::convert(LExpr::int32(2), NumericKind::Float64);
        assert_eq!(fold_constants(widened), LExpr::Const(Value::Float64(2.0)));
    }

    #[test]
    fn test_mixed_arithmetic_is_widened() {
        let value = returned("func f(x as int) as float = x + 1.5;");
        let LExpr::Binary { kind, left, .. } = value else {
            panic!("Expected binary expression");
        };
        assert_eq!(kind, NumericKind::Float64);
        assert!(matches!(*left, LExpr::Convert { kind: NumericKind::Float64, .. }));
    }

    #[test]
    fn test_division_is_float() {
        let value = returned("func f(a as int, b as int) as float = a / b;");
        assert!(matches!(value, LExpr::Binary { op: BinaryOp::Divide, kind: NumericKind::Float64, .. }));
    }

    #[test]
    fn test_unoptimized_constants_stay() {
        let options = CompileOptions {
            optimize: false,
            ..CompileOptions::default()
        };
        let program = lower_source_with("param constant = 2 * 3;", &options);
        let ParameterSource::Cached(routine) = &program.parameters[0].source else {
            panic!("Expected cached parameter");
        };
        assert!(matches!(
            routine.body[0],
            LStmt::Return(Some(LExpr::Binary { op: BinaryOp::Multiply, .. }))
        ));
    }

    #[test]
    fn test_stage_reads_resolve_through_hold_state() {
        let program = lower_source(
            "stage f as int holds 2;
             operation { f <= f + f<now - 1>; }",
        );
        let LStmt::ForEachTick(tick) = &program.run.body[0] else {
            panic!("Expected the tick loop");
        };
        let LStmt::Expr(LExpr::Assign { place, value }) = &tick[1] else {
            panic!("Expected stage assignment, found {:?}", tick[1]);
        };
        // Target: next % 3.
        let LPlace::Stage { slot, .. } = place else {
            panic!("Expected stage place");
        };
        assert!(matches!(**slot, LExpr::Binary { op: BinaryOp::Modulo, .. }));
        let LExpr::Binary { left, .. } = &**slot else {
            unreachable!()
        };
        assert_eq!(**left, next_time());

        // Source: the bare read is `now`.
        let LExpr::Binary { left: read, .. } = &**value else {
            panic!("Expected sum");
        };
        let LExpr::Load(LPlace::Stage { slot, .. }) = &**read else {
            panic!("Expected stage read");
        };
        let LExpr::Binary { left: time, .. } = &**slot else {
            panic!("Expected modulo slot");
        };
        assert_eq!(**time, LExpr::Now);
    }

    #[test]
    fn test_cached_array_stage_uses_slot_cache() {
        let program = lower_source(
            "stage a as int[3];
             operation { a[0] <= a[1]; }",
        );
        let LStmt::ForEachTick(tick) = &program.run.body[0] else {
            panic!("Expected the tick loop");
        };
        let Some(LStmt::Expr(LExpr::Assign { place, value })) = tick.last() else {
            panic!("Expected assignment");
        };
        let LPlace::Index { target, .. } = place else {
            panic!("Expected element place");
        };
        assert!(matches!(
            **target,
            LPlace::Stage { ref slot, .. } if **slot == LExpr::StageSlot { stage: 0, next: true }
        ));
        assert!(matches!(
            **value,
            LExpr::Load(LPlace::Index { ref target, .. })
                if matches!(**target, LPlace::Stage { ref slot, .. } if **slot == LExpr::StageSlot { stage: 0, next: false })
        ));
    }

    #[test]
    fn test_parameter_reads() {
        let program = lower_source(
            "param ext;
             param timed = now * 1.5;
             func f() as float = ext + timed;",
        );
        let LStmt::Return(Some(LExpr::Binary { left, right, .. })) = &program.functions[0].body[0] else {
            panic!("Expected sum");
        };
        assert!(matches!(**left, LExpr::Parameter(0) | LExpr::Convert { .. }));
        assert_eq!(**right, LExpr::EvaluateParameter(1));
    }
}
