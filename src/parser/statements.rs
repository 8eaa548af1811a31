use crate::ast::{AssignmentKind, BinaryOperator, Block, ExprKind, Expression, Statement, StmtKind};
use crate::error::{DiagnosticKind, Position};
use crate::lexer::{Keyword, Symbol, TokenKind};
use crate::symbol_table::{self, ScopeKind, SymbolId, SymbolKind};
use crate::types::TypeData;

use super::Parser;

/// Statement-level assignment operators and the operator a compound form expands to.
fn assignment_operator(kind: &TokenKind) -> Option<(AssignmentKind, Option<BinaryOperator>)> {
    let TokenKind::Symbol(symbol) = kind else {
        return None;
    };
    let operator = match symbol {
        Symbol::Equals => (AssignmentKind::Normal, None),
        Symbol::AddAssign => (AssignmentKind::Normal, Some(BinaryOperator::Add)),
        Symbol::SubtractAssign => (AssignmentKind::Normal, Some(BinaryOperator::Subtract)),
        Symbol::MultiplyAssign => (AssignmentKind::Normal, Some(BinaryOperator::Multiply)),
        Symbol::DivideAssign => (AssignmentKind::Normal, Some(BinaryOperator::Divide)),
        Symbol::LessOrEqual => (AssignmentKind::Stage, None),
        Symbol::AddStageAssign => (AssignmentKind::Stage, Some(BinaryOperator::Add)),
        Symbol::SubtractStageAssign => (AssignmentKind::Stage, Some(BinaryOperator::Subtract)),
        Symbol::MultiplyStageAssign => (AssignmentKind::Stage, Some(BinaryOperator::Multiply)),
        Symbol::DivideStageAssign => (AssignmentKind::Stage, Some(BinaryOperator::Divide)),
        _ => return None,
    };
    Some(operator)
}

impl<'a> Parser<'a> {
    pub(super) fn parse_statement(&mut self) -> Statement {
        let token = self.tokens.peek().clone();
        let position = token.position;

        match token.kind {
            TokenKind::Symbol(Symbol::LeftBrace) => {
                let block = self.parse_scoped_body(ScopeKind::Block);
                Statement::new(StmtKind::Block(block), position)
            }
            TokenKind::Symbol(Symbol::Semicolon) => {
                self.tokens.read();
                let empty = Block::new(self.table.current_scope());
                Statement::new(StmtKind::Block(empty), position)
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(false, position),
            TokenKind::Keyword(Keyword::Each) => self.parse_each(false, position),
            TokenKind::Keyword(Keyword::Parallel) => {
                self.tokens.read();
                if self.check_keyword(Keyword::For) {
                    self.parse_for(true, position)
                } else if self.check_keyword(Keyword::Each) {
                    self.parse_each(true, position)
                } else {
                    self.unexpected("'for' or 'each' after 'parallel'");
                    self.synchronize();
                    Statement::invalid(position)
                }
            }
            TokenKind::Keyword(Keyword::Var) => self.parse_var_decl(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Break) => self.parse_break(),
            TokenKind::Keyword(Keyword::Continue) => self.parse_continue(),
            _ => self.parse_expression_statement(),
        }
    }

    /// A loop or branch body: a braced block, or a single statement, in a
    /// fresh scope of `kind`.
    fn parse_scoped_body(&mut self, kind: ScopeKind) -> Block {
        let scope = self.table.enter_scope(kind);
        let block = self.parse_body_in(scope);
        self.table.exit_scope();
        block
    }

    fn parse_body_in(&mut self, scope: symbol_table::ScopeId) -> Block {
        if self.check_symbol(Symbol::LeftBrace) {
            return self.parse_block_body(scope);
        }
        let mut block = Block::new(scope);
        block.statements.push(self.parse_statement());
        block
    }

    fn parse_parenthesized(&mut self) -> Expression {
        self.expect_symbol(Symbol::LeftParen);
        let expression = self.parse_expression();
        self.expect_symbol(Symbol::RightParen);
        expression
    }

    fn expect_statement_end(&mut self) {
        if !self.expect_symbol(Symbol::Semicolon) {
            self.synchronize();
        }
    }

    fn parse_if(&mut self) -> Statement {
        let position = self.tokens.read().position;
        let condition = self.parse_parenthesized();
        let then_branch = self.parse_scoped_body(ScopeKind::Block);

        let else_branch = if self.match_keyword(Keyword::Else) {
            if self.check_keyword(Keyword::If) {
                Some(Box::new(self.parse_if()))
            } else {
                let else_position = self.peek_position();
                let block = self.parse_scoped_body(ScopeKind::Block);
                Some(Box::new(Statement::new(StmtKind::Block(block), else_position)))
            }
        } else {
            None
        };

        Statement::new(
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            position,
        )
    }

    fn parse_while(&mut self) -> Statement {
        let position = self.tokens.read().position;
        let condition = self.parse_parenthesized();
        let body = self.parse_scoped_body(ScopeKind::While);

        Statement::new(StmtKind::While { condition, body }, position)
    }

    /// `for (i = A to B) BODY`, `i` an `int` local of the loop scope.
    fn parse_for(&mut self, parallel: bool, position: Position) -> Statement {
        self.tokens.read();
        if !self.expect_symbol(Symbol::LeftParen) {
            self.synchronize();
            return Statement::invalid(position);
        }
        let Some((index_name, index_position)) = self.expect_identifier() else {
            self.synchronize();
            return Statement::invalid(position);
        };
        self.expect_symbol(Symbol::Equals);
        let from = self.parse_expression();
        self.expect_keyword(Keyword::To);
        let to = self.parse_expression();
        self.expect_symbol(Symbol::RightParen);

        let scope = self.table.enter_scope(ScopeKind::For { parallel });
        let index = self.define_local(&index_name, index_position, Some(TypeData::INT32), None);
        let body = self.parse_body_in(scope);
        self.table.exit_scope();

        match index {
            Some(index) => Statement::new(
                StmtKind::For {
                    index,
                    from,
                    to,
                    body,
                    parallel,
                },
                position,
            ),
            None => Statement::invalid(position),
        }
    }

    /// `each (at i, j in ARRAY) BODY`.
    fn parse_each(&mut self, parallel: bool, position: Position) -> Statement {
        self.tokens.read();
        if !self.expect_symbol(Symbol::LeftParen) || !self.expect_keyword(Keyword::At) {
            self.synchronize();
            return Statement::invalid(position);
        }

        let mut names = Vec::new();
        loop {
            let Some(name) = self.expect_identifier() else {
                self.synchronize();
                return Statement::invalid(position);
            };
            names.push(name);
            if !self.match_symbol(Symbol::Comma) {
                break;
            }
        }
        self.expect_keyword(Keyword::In);
        let mut target = self.parse_expression();
        self.expect_symbol(Symbol::RightParen);
        // Iterated stages are addressed at `now`.
        if target.is_place() {
            target.mark_assignment_target(AssignmentKind::Normal);
        }

        let scope = self.table.enter_scope(ScopeKind::Each {
            parallel,
            indices: names.len(),
        });
        let indices: Vec<Option<SymbolId>> = names
            .iter()
            .map(|(name, at)| self.define_local(name, *at, Some(TypeData::INT32), None))
            .collect();
        let body = self.parse_body_in(scope);
        self.table.exit_scope();

        match indices.into_iter().collect::<Option<Vec<_>>>() {
            Some(indices) => Statement::new(
                StmtKind::EachAt {
                    indices,
                    target,
                    body,
                    parallel,
                },
                position,
            ),
            None => Statement::invalid(position),
        }
    }

    fn parse_var_decl(&mut self) -> Statement {
        let position = self.tokens.read().position;
        let Some((name, name_position)) = self.expect_identifier() else {
            self.synchronize();
            return Statement::invalid(position);
        };
        let ty = if self.match_keyword(Keyword::As) {
            Some(self.parse_type())
        } else {
            None
        };
        if !self.expect_symbol(Symbol::Equals) {
            self.synchronize();
            return Statement::invalid(position);
        }
        let initializer = self.parse_expression();
        self.expect_statement_end();

        match self.define_local(&name, name_position, ty, Some(initializer)) {
            Some(symbol) => Statement::new(StmtKind::VarDecl { symbol }, position),
            None => Statement::invalid(position),
        }
    }

    /// Defines a local in the current scope, reporting duplicates and
    /// collisions with non-variable names.
    fn define_local(
        &mut self,
        name: &str,
        position: Position,
        ty: Option<TypeData>,
        initializer: Option<Expression>,
    ) -> Option<SymbolId> {
        if self.table.lookup_current_scope(name).is_some() {
            self.error(
                DiagnosticKind::Name,
                position,
                format!("'{}' is already declared in this scope", name),
            );
            return None;
        }

        if let Some(outer) = self.table.resolve(name) {
            let outer = self.table.symbol(outer);
            if !outer.is_variable() {
                let message = format!("'{}' is already declared as a {}", name, outer.kind_name());
                self.error(DiagnosticKind::Name, position, message);
                return None;
            }
            if self.options.prohibit_overloading_of_variable {
                self.error(
                    DiagnosticKind::Name,
                    position,
                    format!("'{}' shadows a variable of an enclosing scope", name),
                );
                return None;
            }
        }

        let unique_no = self.table.next_unique_no();
        let symbol = symbol_table::Symbol::new(
            name,
            SymbolKind::LocalVariable {
                initializer,
                unique_no,
            },
            ty,
            position,
        );
        self.table.define(symbol).ok()
    }

    fn parse_return(&mut self) -> Statement {
        let position = self.tokens.read().position;
        if self.match_symbol(Symbol::Semicolon) {
            return Statement::new(StmtKind::Return(None), position);
        }

        let value = self.parse_expression();
        self.expect_statement_end();

        if self.table.is_inside_parallel_loop(self.table.current_scope()) {
            self.error(
                DiagnosticKind::Context,
                position,
                "cannot return a value from inside a parallel loop",
            );
        }

        Statement::new(StmtKind::Return(Some(value)), position)
    }

    fn parse_break(&mut self) -> Statement {
        let position = self.tokens.read().position;
        self.expect_statement_end();

        let scope = self.table.current_scope();
        if self.table.innermost_loop(scope).is_none() {
            self.error(DiagnosticKind::Context, position, "'break' outside of a loop");
        } else if self.table.is_inside_parallel_loop(scope) {
            self.error(
                DiagnosticKind::Context,
                position,
                "'break' is not allowed inside a parallel loop",
            );
        }

        Statement::new(StmtKind::Break, position)
    }

    fn parse_continue(&mut self) -> Statement {
        let position = self.tokens.read().position;
        self.expect_statement_end();

        let ends_iteration = match self.table.innermost_loop(self.table.current_scope()) {
            None => {
                self.error(DiagnosticKind::Context, position, "'continue' outside of a loop");
                false
            }
            Some(ScopeKind::For { parallel: true }) => true,
            Some(ScopeKind::Each {
                parallel: true,
                indices: 1,
            }) => true,
            Some(_) => false,
        };

        Statement::new(StmtKind::Continue { ends_iteration }, position)
    }

    /// An assignment is only tried at statement level: the left side is read
    /// at unary level and, without an assignment operator after it, the
    /// statement is re-read as a plain expression where `=` means equality.
    fn parse_expression_statement(&mut self) -> Statement {
        let position = self.peek_position();
        let checkpoint = self.tokens.cursor();
        let reported = self.diagnostics.len();

        let target = self.parse_unary();
        let expression = match assignment_operator(&self.tokens.peek().kind) {
            Some((kind, op)) => {
                let operator_position = self.tokens.read().position;
                let value = self.parse_expression();
                self.build_assignment(target, kind, op, value, operator_position)
            }
            None => {
                self.tokens.rewind(checkpoint);
                self.diagnostics.truncate(reported);
                self.parse_expression()
            }
        };
        self.expect_statement_end();

        Statement::new(StmtKind::Expression(expression), position)
    }

    fn build_assignment(
        &mut self,
        mut target: Expression,
        kind: AssignmentKind,
        op: Option<BinaryOperator>,
        value: Expression,
        position: Position,
    ) -> Expression {
        if target.is_invalid() || !self.check_assignable(&target, kind, position) {
            return Expression::invalid(target.position);
        }
        target.mark_assignment_target(kind);

        let value = match op {
            Some(op) => Expression::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(target.clone()),
                    right: Box::new(value),
                },
                position,
            ),
            None => value,
        };

        let target_position = target.position;
        Expression::new(
            ExprKind::Assign {
                kind,
                target: Box::new(target),
                value: Box::new(value),
            },
            target_position,
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{
        AccessContext, AssignmentKind, BinaryOperator, ExprKind, ProgramUnit, Statement, StmtKind,
    };
    use crate::error::{DiagnosticKind, Diagnostics};
    use crate::options::CompileOptions;
    use crate::parser::parse_source;
    use crate::symbol_table::SymbolKind;

    fn parse(source: &str) -> (ProgramUnit, Diagnostics) {
        parse_source(source, &CompileOptions::default())
    }

    fn operation_statements(unit: &ProgramUnit) -> Vec<Statement> {
        let id = unit.operation().unwrap();
        match &unit.table.symbol(id).kind {
            SymbolKind::Operation { body: Some(block) } => block.statements.clone(),
            _ => panic!("Expected operation body"),
        }
    }

    fn parse_statement_from_string(declarations: &str, statements: &str) -> Vec<Statement> {
        let source = format!("{}\noperation {{ {} }}", declarations, statements);
        let (unit, diagnostics) = parse(&source);
        assert!(!diagnostics.has_errors(), "{}", diagnostics);
        operation_statements(&unit)
    }

    #[test]
    fn test_stage_assignment_marks_next() {
        let statements = parse_statement_from_string("stage v as int;", "v <= v + 1;");
        let StmtKind::Expression(expr) = &statements[0].kind else {
            panic!("Expected expression statement");
        };
        let ExprKind::Assign { kind, target, value } = &expr.kind else {
            panic!("Expected assignment");
        };
        assert_eq!(*kind, AssignmentKind::Stage);
        assert!(matches!(
            target.kind,
            ExprKind::Variable {
                context: AccessContext {
                    is_write_target: true,
                    is_stage_assignment: true
                },
                ..
            }
        ));
        // The right side reads the current value.
        let ExprKind::Binary { left, .. } = &value.kind else {
            panic!("Expected binary value");
        };
        assert!(matches!(
            left.kind,
            ExprKind::Variable {
                context: AccessContext {
                    is_write_target: false,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn test_compound_stage_assignment_expands() {
        let statements = parse_statement_from_string("stage v as int;", "v +<= 2;");
        let StmtKind::Expression(expr) = &statements[0].kind else {
            panic!("Expected expression statement");
        };
        let ExprKind::Assign { value, .. } = &expr.kind else {
            panic!("Expected assignment");
        };
        let ExprKind::Binary { op, left, .. } = &value.kind else {
            panic!("Expected binary value");
        };
        assert_eq!(*op, BinaryOperator::Add);
        assert!(matches!(
            left.kind,
            ExprKind::Variable {
                context: AccessContext {
                    is_stage_assignment: true,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn test_equality_statement_is_not_assignment() {
        let statements = parse_statement_from_string("stage v as int;", "v<now> + 1 = 3;");
        let StmtKind::Expression(expr) = &statements[0].kind else {
            panic!("Expected expression statement");
        };
        assert!(matches!(
            expr.kind,
            ExprKind::Binary {
                op: BinaryOperator::Equal,
                ..
            }
        ));
    }

    #[test]
    fn test_bare_stage_normal_assignment_is_context_error() {
        let (_, diagnostics) = parse("stage v as int; operation { v = 3; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Context), 1);

        let (_, diagnostics) = parse("stage v as int; operation { v<next> = 3; v++; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Context), 1);
    }

    #[test]
    fn test_stage_assignment_to_local_is_context_error() {
        let (_, diagnostics) = parse("operation { var x = 1; x <= 2; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Context), 1);
    }

    #[test]
    fn test_assignment_to_parameter_is_type_error() {
        let (_, diagnostics) = parse("param p = 1; operation { p = 2; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Type), 1);
    }

    #[test]
    fn test_loops() {
        let statements = parse_statement_from_string(
            "stage a as int[10];",
            "for (i = 0 to 9) { a<next>[i] = i; }
             parallel each (at i in a) { a[i] <= 0; }
             while (true) { break; }",
        );
        assert!(matches!(statements[0].kind, StmtKind::For { parallel: false, .. }));
        let StmtKind::EachAt {
            indices,
            target,
            parallel,
            ..
        } = &statements[1].kind
        else {
            panic!("Expected each statement");
        };
        assert!(*parallel);
        assert_eq!(indices.len(), 1);
        assert!(matches!(
            target.kind,
            ExprKind::Variable {
                context: AccessContext {
                    is_write_target: true,
                    is_stage_assignment: false,
                },
                ..
            }
        ));
        assert!(matches!(statements[2].kind, StmtKind::While { .. }));
    }

    #[test]
    fn test_break_rules() {
        let (_, diagnostics) = parse("operation { break; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Context), 1);

        let (_, diagnostics) = parse(
            "operation { parallel for (i = 0 to 3) { while (true) { break; } } }",
        );
        assert_eq!(diagnostics.count_of(DiagnosticKind::Context), 1);

        let (_, diagnostics) = parse("operation { for (i = 0 to 3) { while (true) { break; } } }");
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn test_continue_in_parallel_loops() {
        let statements = parse_statement_from_string(
            "stage a as int[2, 2];",
            "parallel for (i = 0 to 3) { continue; }
             parallel each (at i, j in a) { continue; }
             parallel each (at i in a) { while (true) { continue; } }",
        );
        let StmtKind::For { body, .. } = &statements[0].kind else {
            panic!("Expected for statement");
        };
        assert!(matches!(
            body.statements[0].kind,
            StmtKind::Continue {
                ends_iteration: true
            }
        ));
        let StmtKind::EachAt { body, .. } = &statements[1].kind else {
            panic!("Expected each statement");
        };
        assert!(matches!(
            body.statements[0].kind,
            StmtKind::Continue {
                ends_iteration: false
            }
        ));
        let StmtKind::EachAt { body, .. } = &statements[2].kind else {
            panic!("Expected each statement");
        };
        let StmtKind::While { body, .. } = &body.statements[0].kind else {
            panic!("Expected while statement");
        };
        assert!(matches!(
            body.statements[0].kind,
            StmtKind::Continue {
                ends_iteration: false
            }
        ));
    }

    #[test]
    fn test_return_value_in_parallel_loop() {
        let (_, diagnostics) = parse(
            "func f() as int { parallel for (i = 0 to 3) { return 1; } return 0; }",
        );
        assert_eq!(diagnostics.count_of(DiagnosticKind::Context), 1);

        let (_, diagnostics) = parse("operation { parallel for (i = 0 to 3) { return; } }");
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn test_local_declarations() {
        let (_, diagnostics) = parse("operation { var x = 1; var x = 2; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Name), 1);

        let (_, diagnostics) = parse("func f() = 1; operation { var f = 1; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Name), 1);

        let (_, diagnostics) = parse("operation { var x = 1; { var x = 2; } }");
        assert!(!diagnostics.has_errors());

        let options = CompileOptions {
            prohibit_overloading_of_variable: true,
            ..CompileOptions::default()
        };
        let (_, diagnostics) = parse_source("operation { var x = 1; { var x = 2; } }", &options);
        assert_eq!(diagnostics.count_of(DiagnosticKind::Name), 1);
    }

    #[test]
    fn test_if_else_chain() {
        let statements = parse_statement_from_string(
            "",
            "var x = 1; if (x < 0) { x = 0; } else if (x > 5) x = 5; else { x = 2; }",
        );
        let StmtKind::If { else_branch, .. } = &statements[1].kind else {
            panic!("Expected if statement");
        };
        let Some(else_branch) = else_branch else {
            panic!("Expected else branch");
        };
        assert!(matches!(
            else_branch.kind,
            StmtKind::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_missing_semicolon_recovers() {
        let (unit, diagnostics) = parse("stage v as int; operation { v<next> = 1 v<next> = 2; v<next> = 3; }");
        assert_eq!(diagnostics.count_of(DiagnosticKind::Syntax), 1);
        assert_eq!(operation_statements(&unit).len(), 2);
    }
}
