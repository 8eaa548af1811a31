use crate::ast::{Block, Expression, Statement, StmtKind};
use crate::symbol_table::{SymbolId, SymbolKind};
use crate::types::{NumericKind, TypeData};

use super::ir::{BinaryOp, LExpr, LPlace, LStmt, LType, LocalId};
use super::Lowerer;

impl Lowerer<'_> {
    pub(super) fn lower_block(&mut self, block: &Block) -> Vec<LStmt> {
        let mut lowered = Vec::with_capacity(block.statements.len());
        for statement in &block.statements {
            self.lower_statement(statement, &mut lowered);
        }
        lowered
    }

    fn lower_statement(&mut self, statement: &Statement, out: &mut Vec<LStmt>) {
        match &statement.kind {
            StmtKind::Invalid => unreachable!("invalid statement reached lowering"),
            StmtKind::Block(block) => out.extend(self.lower_block(block)),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.lower_as(condition, &TypeData::BOOL);
                let then_branch = self.lower_block(then_branch);
                let mut else_lowered = Vec::new();
                if let Some(else_branch) = else_branch {
                    self.lower_statement(else_branch, &mut else_lowered);
                }
                out.push(LStmt::If {
                    condition,
                    then_branch,
                    else_branch: else_lowered,
                });
            }
            StmtKind::While { condition, body } => {
                let condition = self.lower_as(condition, &TypeData::BOOL);
                let body = self.lower_block(body);
                out.push(LStmt::While { condition, body });
            }
            StmtKind::For {
                index,
                from,
                to,
                body,
                parallel,
            } => {
                let from = self.lower_as_kind(from, NumericKind::Int32);
                let to = self.lower_as_kind(to, NumericKind::Int32);
                let range = self.lower_range(*index, from, to, *parallel, |lowerer| lowerer.lower_block(body));
                out.push(range);
            }
            StmtKind::EachAt {
                indices,
                target,
                body,
                parallel,
            } => self.lower_each(indices, target, body, *parallel, out),
            StmtKind::VarDecl { symbol } => {
                let table = self.table;
                let SymbolKind::LocalVariable { initializer, .. } = &table.symbol(*symbol).kind else {
                    unreachable!("'{}' is not a local", table.symbol(*symbol).name);
                };
                let ty = self.symbol_type(*symbol);
                let init = initializer
                    .as_ref()
                    .map(|initializer| self.lower_as(initializer, &ty));
                let local = self.declare_local(*symbol);
                let ty = self.routine.locals[local].ty.clone();
                out.push(LStmt::DeclareLocal { local, ty, init });
            }
            StmtKind::Return(None) if self.routine.parallel_depth > 0 => out.push(LStmt::EndIteration),
            StmtKind::Return(value) => {
                let returns = self.routine.return_type.clone().unwrap_or(TypeData::Nothing);
                let value = value.as_ref().map(|value| self.lower_as(value, &returns));
                out.push(LStmt::Return(value));
            }
            StmtKind::Break => out.push(LStmt::Break),
            StmtKind::Continue { ends_iteration: true } => out.push(LStmt::EndIteration),
            StmtKind::Continue { ends_iteration: false } => out.push(LStmt::Continue),
            StmtKind::Expression(expression) => out.push(LStmt::Expr(self.lower_expression(expression))),
        }
    }

    /// Builds a counted loop over `index`. Locals declared before the loop
    /// are the ones a parallel iteration may write back.
    fn lower_range(
        &mut self,
        index: SymbolId,
        from: LExpr,
        to: LExpr,
        parallel: bool,
        body: impl FnOnce(&mut Self) -> Vec<LStmt>,
    ) -> LStmt {
        let shared_locals = self.routine.locals.len();
        let local = self.declare_local(index);

        if parallel {
            self.routine.parallel_depth += 1;
        }
        let body = body(self);
        if parallel {
            self.routine.parallel_depth -= 1;
        }

        LStmt::Range {
            local,
            from,
            to,
            body,
            parallel,
            fan_out: parallel && self.options.parallelization_option.parallel_code(),
            shared_locals,
        }
    }

    /// `each (at i, j in a)` becomes one range per index; only the outermost
    /// one carries the parallel annotation.
    fn lower_each(
        &mut self,
        indices: &[SymbolId],
        target: &Expression,
        body: &Block,
        parallel: bool,
        out: &mut Vec<LStmt>,
    ) {
        // Lengths are read through a place so no level copies the array.
        let array = match self.lower_expression(target) {
            LExpr::Load(place) => place,
            value => {
                let ty = self.type_of(target);
                let ty = self.lower_type(&ty);
                let temp = self.temp_local(ty.clone());
                out.push(LStmt::DeclareLocal {
                    local: temp,
                    ty,
                    init: Some(value),
                });
                LPlace::Local(temp)
            }
        };
        out.extend(self.lower_each_level(&array, indices, body, parallel));
    }

    fn lower_each_level(
        &mut self,
        array: &LPlace,
        indices: &[SymbolId],
        body: &Block,
        parallel: bool,
    ) -> Vec<LStmt> {
        let Some((index, inner)) = indices.split_first() else {
            return self.lower_block(body);
        };

        let bound = self.temp_local(LType::Numeric(NumericKind::Int32));
        let declare_bound = LStmt::DeclareLocal {
            local: bound,
            ty: LType::Numeric(NumericKind::Int32),
            init: Some(LExpr::binary(
                BinaryOp::Subtract,
                LExpr::Length(Box::new(LExpr::Load(array.clone()))),
                LExpr::int32(1),
                NumericKind::Int32,
            )),
        };

        let range = self.lower_range(*index, LExpr::int32(0), LExpr::local(bound), parallel, |lowerer| {
            let local: LocalId = lowerer.local_id(*index);
            let element = LPlace::Index {
                target: Box::new(array.clone()),
                index: Box::new(LExpr::local(local)),
            };
            lowerer.lower_each_level(&element, inner, body, false)
        });
        vec![declare_bound, range]
    }
}
