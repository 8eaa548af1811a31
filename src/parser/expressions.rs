use crate::ast::{
    AccessContext, AssignmentKind, BinaryOperator, Callee, ExprKind, Expression, UnaryOperator,
};
use crate::error::{DiagnosticKind, Position};
use crate::lexer::{Keyword, Symbol, TokenKind};
use crate::symbol_table::SymbolKind;
use crate::types::NumericKind;

use super::Parser;

fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Expression {
    let position = left.position;
    Expression::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        position,
    )
}

impl<'a> Parser<'a> {
    pub(super) fn parse_expression(&mut self) -> Expression {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Expression {
        let condition = self.parse_logical_or();
        if !self.match_symbol(Symbol::Question) {
            return condition;
        }

        let position = condition.position;
        let if_true = self.parse_expression();
        self.expect_symbol(Symbol::Colon);
        let if_false = self.parse_expression();

        Expression::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            },
            position,
        )
    }

    fn parse_logical_or(&mut self) -> Expression {
        let mut expr = self.parse_logical_and();

        while self.match_keyword(Keyword::Or) {
            let right = self.parse_logical_and();
            expr = binary(BinaryOperator::Or, expr, right);
        }

        expr
    }

    fn parse_logical_and(&mut self) -> Expression {
        let mut expr = self.parse_equality();

        while self.match_keyword(Keyword::And) {
            let right = self.parse_equality();
            expr = binary(BinaryOperator::And, expr, right);
        }

        expr
    }

    fn parse_equality(&mut self) -> Expression {
        let mut expr = self.parse_relational();

        loop {
            let op = match self.tokens.peek().kind {
                TokenKind::Symbol(Symbol::Equals) => BinaryOperator::Equal,
                TokenKind::Symbol(Symbol::NotEqual) => BinaryOperator::NotEqual,
                _ => break,
            };
            self.tokens.read();
            let right = self.parse_relational();
            expr = binary(op, expr, right);
        }

        expr
    }

    fn parse_relational(&mut self) -> Expression {
        let mut expr = self.parse_conversion();

        loop {
            let op = match self.tokens.peek().kind {
                TokenKind::Symbol(Symbol::Less) => BinaryOperator::Less,
                TokenKind::Symbol(Symbol::LessOrEqual) => BinaryOperator::LessOrEqual,
                TokenKind::Symbol(Symbol::Greater) => BinaryOperator::Greater,
                TokenKind::Symbol(Symbol::GreaterOrEqual) => BinaryOperator::GreaterOrEqual,
                _ => break,
            };
            self.tokens.read();
            let right = self.parse_conversion();
            expr = binary(op, expr, right);
        }

        expr
    }

    fn parse_conversion(&mut self) -> Expression {
        let mut expr = self.parse_additive();

        while self.match_keyword(Keyword::As) {
            let position = expr.position;
            let target = self.parse_type();
            expr = Expression::new(
                ExprKind::Conversion {
                    operand: Box::new(expr),
                    target,
                },
                position,
            );
        }

        expr
    }

    pub(super) fn parse_additive(&mut self) -> Expression {
        let mut expr = self.parse_multiplicative();

        loop {
            let op = match self.tokens.peek().kind {
                TokenKind::Symbol(Symbol::Plus) => BinaryOperator::Add,
                TokenKind::Symbol(Symbol::Minus) => BinaryOperator::Subtract,
                _ => break,
            };
            self.tokens.read();
            let right = self.parse_multiplicative();
            expr = binary(op, expr, right);
        }

        expr
    }

    fn parse_multiplicative(&mut self) -> Expression {
        let mut expr = self.parse_unary();

        loop {
            let op = match self.tokens.peek().kind {
                TokenKind::Symbol(Symbol::Star) => BinaryOperator::Multiply,
                TokenKind::Symbol(Symbol::Slash) => BinaryOperator::Divide,
                TokenKind::Keyword(Keyword::Idiv) => BinaryOperator::IntegerDivide,
                TokenKind::Keyword(Keyword::Mod) => BinaryOperator::Modulo,
                _ => break,
            };
            self.tokens.read();
            let right = self.parse_unary();
            expr = binary(op, expr, right);
        }

        expr
    }

    pub(super) fn parse_unary(&mut self) -> Expression {
        let position = self.peek_position();
        let op = match self.tokens.peek().kind {
            TokenKind::Symbol(Symbol::Plus) => UnaryOperator::Plus,
            TokenKind::Symbol(Symbol::Minus) => UnaryOperator::Negate,
            TokenKind::Symbol(Symbol::Increment) => UnaryOperator::PreIncrement,
            TokenKind::Symbol(Symbol::Decrement) => UnaryOperator::PreDecrement,
            TokenKind::Symbol(Symbol::Bang) | TokenKind::Keyword(Keyword::Not) => UnaryOperator::Not,
            _ => return self.parse_postfix(),
        };
        self.tokens.read();

        let mut operand = self.parse_unary();
        if op.mutates_operand() {
            operand = self.increment_target(operand, position);
        }

        Expression::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            position,
        )
    }

    fn parse_postfix(&mut self) -> Expression {
        let mut expr = self.parse_primary();

        loop {
            let token = self.tokens.peek().clone();
            match token.kind {
                TokenKind::Symbol(symbol @ (Symbol::Increment | Symbol::Decrement)) => {
                    self.tokens.read();
                    let op = if symbol == Symbol::Increment {
                        UnaryOperator::PostIncrement
                    } else {
                        UnaryOperator::PostDecrement
                    };
                    let position = expr.position;
                    let operand = self.increment_target(expr, token.position);
                    expr = Expression::new(
                        ExprKind::Unary {
                            op,
                            operand: Box::new(operand),
                        },
                        position,
                    );
                }
                TokenKind::Symbol(Symbol::Less) => {
                    let stage = match expr.kind {
                        ExprKind::Variable { symbol, .. } if self.table.symbol(symbol).is_stage() => symbol,
                        _ => break,
                    };
                    self.tokens.read();
                    let time = self.parse_additive();
                    self.expect_symbol(Symbol::Greater);
                    expr = Expression::new(
                        ExprKind::TimeSpecified {
                            stage,
                            time: Box::new(time),
                            context: AccessContext::default(),
                        },
                        expr.position,
                    );
                }
                TokenKind::Symbol(Symbol::LeftBracket) => {
                    self.tokens.read();
                    let indices = self.parse_arguments(Symbol::RightBracket);
                    let position = expr.position;
                    expr = Expression::new(
                        ExprKind::Index {
                            target: Box::new(expr),
                            indices,
                        },
                        position,
                    );
                }
                TokenKind::Symbol(Symbol::Dot) => {
                    self.tokens.read();
                    let Some((field, _)) = self.expect_identifier() else {
                        return Expression::invalid(token.position);
                    };
                    let position = expr.position;
                    expr = Expression::new(
                        ExprKind::Field {
                            target: Box::new(expr),
                            field,
                        },
                        position,
                    );
                }
                TokenKind::Symbol(Symbol::LeftParen) => {
                    if !expr.is_invalid() {
                        self.error(
                            DiagnosticKind::Type,
                            token.position,
                            "expression is not a function",
                        );
                    }
                    self.tokens.read();
                    self.parse_arguments(Symbol::RightParen);
                    expr = Expression::invalid(expr.position);
                }
                _ => break,
            }
        }

        expr
    }

    fn parse_primary(&mut self) -> Expression {
        let token = self.tokens.peek().clone();
        let position = token.position;

        let kind = match token.kind {
            TokenKind::IntegerLiteral(value) => {
                let kind = if i32::try_from(value).is_ok() {
                    NumericKind::Int32
                } else {
                    NumericKind::Int64
                };
                ExprKind::Integer { value, kind }
            }
            TokenKind::FloatLiteral(value) => ExprKind::Float(value),
            TokenKind::Keyword(Keyword::True) => ExprKind::Bool(true),
            TokenKind::Keyword(Keyword::False) => ExprKind::Bool(false),
            TokenKind::Keyword(Keyword::Now) => ExprKind::Now,
            TokenKind::Keyword(Keyword::Next) => ExprKind::Next,
            TokenKind::Symbol(Symbol::LeftParen) => {
                self.tokens.read();
                let expr = self.parse_expression();
                self.expect_symbol(Symbol::RightParen);
                return expr;
            }
            TokenKind::Identifier(name) => {
                self.tokens.read();
                return self.parse_identifier(&name, position);
            }
            // Already reported by the lexer.
            TokenKind::Invalid => ExprKind::Invalid,
            _ => {
                self.unexpected("an expression");
                let boundary = self.check_symbol(Symbol::Semicolon)
                    || self.check_symbol(Symbol::RightBrace)
                    || self.check_symbol(Symbol::RightParen)
                    || self.tokens.is_at_end();
                if !boundary {
                    self.tokens.read();
                }
                return Expression::invalid(position);
            }
        };

        self.tokens.read();
        Expression::new(kind, position)
    }

    fn parse_identifier(&mut self, name: &str, position: Position) -> Expression {
        let Some(id) = self.table.resolve(name) else {
            if let Some(builtin) = self
                .linked_units
                .iter()
                .find_map(|unit| unit.lookup(name))
            {
                return self.parse_call(Callee::Builtin(builtin), name, position);
            }

            self.error(
                DiagnosticKind::Name,
                position,
                format!("'{}' is not declared", name),
            );
            if self.match_symbol(Symbol::LeftParen) {
                self.parse_arguments(Symbol::RightParen);
            }
            return Expression::invalid(position);
        };

        self.table.mark_used(id);
        let symbol = self.table.symbol(id);
        let is_function = matches!(symbol.kind, SymbolKind::Function { .. });
        let is_struct = matches!(symbol.kind, SymbolKind::Struct { .. });
        let is_variable = symbol.is_variable();
        let kind_name = symbol.kind_name();

        if is_function {
            self.parse_call(Callee::Function(id), name, position)
        } else if is_struct {
            if !self.match_symbol(Symbol::LeftParen) {
                self.error(
                    DiagnosticKind::Type,
                    position,
                    format!("struct '{}' is not a value", name),
                );
                return Expression::invalid(position);
            }
            let arguments = self.parse_arguments(Symbol::RightParen);
            Expression::new(
                ExprKind::Construct {
                    structure: id,
                    arguments,
                },
                position,
            )
        } else if is_variable {
            Expression::new(
                ExprKind::Variable {
                    symbol: id,
                    context: AccessContext::default(),
                },
                position,
            )
        } else {
            self.error(
                DiagnosticKind::Type,
                position,
                format!("{} '{}' is not a value", kind_name, name),
            );
            Expression::invalid(position)
        }
    }

    fn parse_call(&mut self, callee: Callee, name: &str, position: Position) -> Expression {
        if !self.match_symbol(Symbol::LeftParen) {
            self.error(
                DiagnosticKind::Type,
                position,
                format!("function '{}' must be called", name),
            );
            return Expression::invalid(position);
        }

        let arguments = self.parse_arguments(Symbol::RightParen);
        Expression::new(ExprKind::Call { callee, arguments }, position)
    }

    /// Comma separated expressions up to `close`; the opening token is already read.
    fn parse_arguments(&mut self, close: Symbol) -> Vec<Expression> {
        let mut arguments = Vec::new();
        if self.match_symbol(close) {
            return arguments;
        }

        loop {
            arguments.push(self.parse_expression());
            if !self.match_symbol(Symbol::Comma) {
                break;
            }
        }
        self.expect_symbol(close);

        arguments
    }

    /// Checks the operand of `++`/`--` and marks it as written.
    fn increment_target(&mut self, mut operand: Expression, position: Position) -> Expression {
        if operand.is_invalid() {
            return operand;
        }
        if self.check_assignable(&operand, AssignmentKind::Normal, position) {
            operand.mark_assignment_target(AssignmentKind::Normal);
        }
        operand
    }

    /// Reports why `target` cannot be written by an assignment of `kind`.
    pub(super) fn check_assignable(
        &mut self,
        target: &Expression,
        kind: AssignmentKind,
        position: Position,
    ) -> bool {
        let root = match target.root_symbol() {
            Some(root) if target.is_place() => root,
            _ => {
                self.error(
                    DiagnosticKind::Type,
                    position,
                    "left side of the assignment is not assignable",
                );
                return false;
            }
        };

        let symbol = self.table.symbol(root);
        let name = symbol.name.clone();
        let kind_name = symbol.kind_name();
        let is_stage = symbol.is_stage();
        let is_local = symbol.is_local();

        if is_stage {
            if kind == AssignmentKind::Normal && target.has_bare_stage_root(&self.table) {
                self.error(
                    DiagnosticKind::Context,
                    position,
                    format!(
                        "stage '{}' can only be modified with a stage assignment or an explicit time",
                        name
                    ),
                );
                return false;
            }
            true
        } else if is_local {
            if kind == AssignmentKind::Stage {
                self.error(
                    DiagnosticKind::Context,
                    position,
                    format!(
                        "stage assignment needs a stage on the left, found {} '{}'",
                        kind_name, name
                    ),
                );
                return false;
            }
            true
        } else {
            self.error(
                DiagnosticKind::Type,
                position,
                format!("cannot assign to {} '{}'", kind_name, name),
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{
        AccessContext, BinaryOperator, ExprKind, Expression, StmtKind, UnaryOperator,
    };
    use crate::error::DiagnosticKind;
    use crate::options::CompileOptions;
    use crate::parser::parse_source;
    use crate::symbol_table::SymbolKind;
    use crate::types::NumericKind;

    /// Parses `expression` as the body of a function and returns it.
    fn parse_expression_from_string(declarations: &str, expression: &str) -> Expression {
        let source = format!("{}\nfunc __probe() = {};", declarations, expression);
        let (unit, diagnostics) = parse_source(&source, &CompileOptions::default());
        assert!(!diagnostics.has_errors(), "{}", diagnostics);
        let id = unit.table.lookup_global("__probe").unwrap();
        match &unit.table.symbol(id).kind {
            SymbolKind::Function {
                body: Some(crate::ast::Body::Expression(expression)),
                ..
            } => expression.clone(),
            _ => panic!("Expected expression-bodied function"),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression_from_string("", "1 + 2 * 3");
        let ExprKind::Binary { op, right, .. } = expr.kind else {
            panic!("Expected binary expression");
        };
        assert_eq!(op, BinaryOperator::Add);
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOperator::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn test_left_associativity() {
        let expr = parse_expression_from_string("", "10 - 4 - 3");
        let ExprKind::Binary { op, left, .. } = expr.kind else {
            panic!("Expected binary expression");
        };
        assert_eq!(op, BinaryOperator::Subtract);
        assert!(matches!(
            left.kind,
            ExprKind::Binary {
                op: BinaryOperator::Subtract,
                ..
            }
        ));
    }

    #[test]
    fn test_logical_levels() {
        let expr = parse_expression_from_string("", "not true and false = false or true");
        let ExprKind::Binary { op, left, .. } = expr.kind else {
            panic!("Expected binary expression");
        };
        assert_eq!(op, BinaryOperator::Or);
        let ExprKind::Binary { op, left, right } = left.kind else {
            panic!("Expected 'and' expression");
        };
        assert_eq!(op, BinaryOperator::And);
        assert!(matches!(
            left.kind,
            ExprKind::Unary {
                op: UnaryOperator::Not,
                ..
            }
        ));
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOperator::Equal,
                ..
            }
        ));
    }

    #[test]
    fn test_conversion_binds_below_additive() {
        let expr = parse_expression_from_string("", "1 + 2 as sbyte");
        let ExprKind::Conversion { operand, target } = expr.kind else {
            panic!("Expected conversion");
        };
        assert_eq!(target, crate::types::TypeData::Numeric(NumericKind::SByte));
        assert!(matches!(operand.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn test_integer_literal_kinds() {
        let small = parse_expression_from_string("", "2147483647");
        assert!(matches!(
            small.kind,
            ExprKind::Integer {
                kind: NumericKind::Int32,
                ..
            }
        ));
        let large = parse_expression_from_string("", "2147483648");
        assert!(matches!(
            large.kind,
            ExprKind::Integer {
                kind: NumericKind::Int64,
                ..
            }
        ));
    }

    #[test]
    fn test_time_specification_only_on_stages() {
        let expr = parse_expression_from_string("stage v as int;", "v<now - 1> + 1");
        let ExprKind::Binary { left, .. } = expr.kind else {
            panic!("Expected binary expression");
        };
        assert!(matches!(left.kind, ExprKind::TimeSpecified { .. }));

        let expr = parse_expression_from_string("param p = 1;", "p < 3");
        assert!(matches!(
            expr.kind,
            ExprKind::Binary {
                op: BinaryOperator::Less,
                ..
            }
        ));
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse_expression_from_string(
            "struct P = (x, y); stage grid as P[3, 3];",
            "grid<now>[1, 2].y",
        );
        let ExprKind::Field { target, field } = expr.kind else {
            panic!("Expected field access");
        };
        assert_eq!(field, "y");
        let ExprKind::Index { target, indices } = target.kind else {
            panic!("Expected index expression");
        };
        assert_eq!(indices.len(), 2);
        assert!(matches!(
            target.kind,
            ExprKind::TimeSpecified {
                context: AccessContext {
                    is_write_target: false,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn test_conditional() {
        let expr = parse_expression_from_string("", "1 < 2 ? 3 : 4");
        assert!(matches!(expr.kind, ExprKind::Conditional { .. }));
    }

    #[test]
    fn test_struct_construction() {
        let expr = parse_expression_from_string("struct P = (x, y);", "P(1.0, 2.0)");
        assert!(matches!(expr.kind, ExprKind::Construct { ref arguments, .. } if arguments.len() == 2));
    }

    #[test]
    fn test_calling_a_variable_is_type_error() {
        let source = "param p = 2; func f() = p(3);";
        let (_, diagnostics) = parse_source(source, &CompileOptions::default());
        assert_eq!(diagnostics.count_of(DiagnosticKind::Type), 1);
    }

    #[test]
    fn test_function_without_call_is_type_error() {
        let source = "func g() = 1; func f() = g + 1;";
        let (_, diagnostics) = parse_source(source, &CompileOptions::default());
        assert_eq!(diagnostics.count_of(DiagnosticKind::Type), 1);
    }

    #[test]
    fn test_undeclared_name() {
        let source = "func f() = missing(1) + other;";
        let (_, diagnostics) = parse_source(source, &CompileOptions::default());
        assert_eq!(diagnostics.count_of(DiagnosticKind::Name), 2);
        assert_eq!(diagnostics.errors().count(), 2);
    }

    #[test]
    fn test_increment_marks_write_target() {
        let source = "operation { var i = 0; i++; }";
        let (unit, diagnostics) = parse_source(source, &CompileOptions::default());
        assert!(!diagnostics.has_errors(), "{}", diagnostics);
        let operation = unit.operation().unwrap();
        let SymbolKind::Operation { body: Some(block) } = &unit.table.symbol(operation).kind else {
            panic!("Expected operation body");
        };
        let StmtKind::Expression(expr) = &block.statements[1].kind else {
            panic!("Expected expression statement");
        };
        let ExprKind::Unary { op, operand } = &expr.kind else {
            panic!("Expected unary expression");
        };
        assert_eq!(*op, UnaryOperator::PostIncrement);
        assert!(matches!(
            operand.kind,
            ExprKind::Variable {
                context: AccessContext {
                    is_write_target: true,
                    ..
                },
                ..
            }
        ));
    }
}
