//! Text listing of a lowered program, written by `--emit-ir`.

use super::ir::{LExpr, LPlace, LStmt, LType, ParameterSource, Program, Routine, UnaryOp};
use crate::runtime::Value;

pub fn print_program(program: &Program) -> String {
    let mut printer = Printer::new(program);
    printer.program();
    printer.output
}

struct Printer<'a> {
    program: &'a Program,
    output: String,
    indent: usize,
}

impl<'a> Printer<'a> {
    fn new(program: &'a Program) -> Self {
        Self {
            program,
            output: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.output.push_str("    ");
        }
        self.output.push_str(text);
        self.output.push('\n');
    }

    fn program(&mut self) {
        let program = self.program;
        self.line(&format!("program {}", program.name));

        for structure in &program.structs {
            let fields: Vec<String> = structure
                .fields
                .iter()
                .map(|(name, ty)| format!("{}: {}", name, self.ty(ty)))
                .collect();
            self.line(&format!("struct {} ({})", structure.name, fields.join(", ")));
        }
        for stage in &program.stages {
            let ty = self.ty(&stage.ty);
            self.line(&format!("stage {}: {} [{}]", stage.name, ty, stage.hold));
        }
        for parameter in &program.parameters {
            let ty = self.ty(&parameter.ty);
            let source = match &parameter.source {
                ParameterSource::External => "external",
                ParameterSource::Cached(_) => "cached",
                ParameterSource::Computed(_) => "computed",
            };
            self.line(&format!("param {}: {} [{}]", parameter.name, ty, source));
            if let Some(routine) = parameter.routine() {
                self.routine_body(routine);
            }
        }
        for function in &program.functions {
            self.routine("func", function);
        }
        self.routine("entry", &program.initialize);
        self.routine("entry", &program.run);
    }

    fn routine(&mut self, keyword: &str, routine: &Routine) {
        let params: Vec<String> = routine.locals[..routine.params]
            .iter()
            .map(|local| format!("{}: {}", local.name, self.ty(&local.ty)))
            .collect();
        let returns = self.ty(&routine.returns);
        self.line(&format!(
            "{} {}({}) -> {}",
            keyword,
            routine.name,
            params.join(", "),
            returns
        ));
        self.routine_body(routine);
    }

    fn routine_body(&mut self, routine: &Routine) {
        self.indent += 1;
        for statement in &routine.body {
            self.statement(routine, statement);
        }
        self.indent -= 1;
    }

    fn block(&mut self, routine: &Routine, statements: &[LStmt]) {
        self.indent += 1;
        for statement in statements {
            self.statement(routine, statement);
        }
        self.indent -= 1;
    }

    fn statement(&mut self, routine: &Routine, statement: &LStmt) {
        match statement {
            LStmt::Expr(expression) => {
                let text = self.expr(routine, expression);
                self.line(&format!("{};", text));
            }
            LStmt::DeclareLocal { local, ty, init } => {
                let ty = self.ty(ty);
                let name = &routine.locals[*local].name;
                let text = match init {
                    Some(init) => format!("var {}: {} = {};", name, ty, self.expr(routine, init)),
                    None => format!("var {}: {};", name, ty),
                };
                self.line(&text);
            }
            LStmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.expr(routine, condition);
                self.line(&format!("if {}", condition));
                self.block(routine, then_branch);
                if !else_branch.is_empty() {
                    self.line("else");
                    self.block(routine, else_branch);
                }
            }
            LStmt::While { condition, body } => {
                let condition = self.expr(routine, condition);
                self.line(&format!("while {}", condition));
                self.block(routine, body);
            }
            LStmt::Range {
                local,
                from,
                to,
                body,
                parallel,
                fan_out,
                ..
            } => {
                let mode = match (parallel, fan_out) {
                    (true, true) => "parallel ",
                    (true, false) => "isolated ",
                    _ => "",
                };
                let from = self.expr(routine, from);
                let to = self.expr(routine, to);
                self.line(&format!(
                    "{}for {} = {} to {}",
                    mode, routine.locals[*local].name, from, to
                ));
                self.block(routine, body);
            }
            LStmt::Return(Some(value)) => {
                let value = self.expr(routine, value);
                self.line(&format!("return {};", value));
            }
            LStmt::Return(None) => self.line("return;"),
            LStmt::Break => self.line("break;"),
            LStmt::Continue => self.line("continue;"),
            LStmt::EndIteration => self.line("end_iteration;"),
            LStmt::AllocateStage(stage) => {
                let text = format!("allocate_stage {};", self.program.stages[*stage].name);
                self.line(&text);
            }
            LStmt::Allocate { stage, slot, guard } => {
                let name = &self.program.stages[*stage].name;
                let slot = self.expr(routine, slot);
                let text = match guard {
                    Some(guard) => format!("allocate {}[{}] if {};", name, slot, self.expr(routine, guard)),
                    None => format!("allocate {}[{}];", name, slot),
                };
                self.line(&text);
            }
            LStmt::SetNow(now) => {
                let now = self.expr(routine, now);
                self.line(&format!("now = {};", now));
            }
            LStmt::ForEachTick(body) => {
                self.line("for now = 0 to max_time - 1");
                self.block(routine, body);
            }
            LStmt::NotifyTimeChanged => self.line("notify_time_changed;"),
            LStmt::CacheParameter(param) => {
                let text = format!("cache_param {};", self.program.parameters[*param].name);
                self.line(&text);
            }
            LStmt::CacheStage(stage) => {
                let text = format!("cache_slots {};", self.program.stages[*stage].name);
                self.line(&text);
            }
        }
    }

    fn ty(&self, ty: &LType) -> String {
        match ty {
            LType::Nothing => "nothing".to_string(),
            LType::Numeric(kind) => kind.name().to_string(),
            LType::Array { element, size } => {
                let size = match size {
                    Some(size) => self.expr_outside(size),
                    None => String::new(),
                };
                format!("{}[{}]", self.ty(element), size)
            }
            LType::Struct { name, .. } => name.clone(),
        }
    }

    /// Size expressions only read parameters and constants.
    fn expr_outside(&self, expression: &LExpr) -> String {
        self.expr(&self.program.initialize, expression)
    }

    fn expr(&self, routine: &Routine, expression: &LExpr) -> String {
        match expression {
            LExpr::Const(value) => constant(value),
            LExpr::Now => "now".to_string(),
            LExpr::MaxTime => "max_time".to_string(),
            LExpr::Load(place) => self.place(routine, place),
            LExpr::Parameter(param) => self.program.parameters[*param].name.clone(),
            LExpr::EvaluateParameter(param) => format!("{}()", self.program.parameters[*param].name),
            LExpr::StageSlot { stage, next } => format!(
                "{}.{}",
                self.program.stages[*stage].name,
                if *next { "next_slot" } else { "now_slot" }
            ),
            LExpr::Unary { op, operand, .. } => {
                let op = match op {
                    UnaryOp::Negate => "-",
                    UnaryOp::Not => "!",
                };
                format!("{}{}", op, self.expr(routine, operand))
            }
            LExpr::Binary {
                op, left, right, ..
            } => format!(
                "({} {} {})",
                self.expr(routine, left),
                op.symbol(),
                self.expr(routine, right)
            ),
            LExpr::Convert { operand, kind } => {
                format!("{}({})", kind.name(), self.expr(routine, operand))
            }
            LExpr::Conditional {
                condition,
                if_true,
                if_false,
            } => format!(
                "({} ? {} : {})",
                self.expr(routine, condition),
                self.expr(routine, if_true),
                self.expr(routine, if_false)
            ),
            LExpr::Call {
                function,
                arguments,
            } => format!(
                "{}({})",
                self.program.functions[*function].name,
                self.list(routine, arguments)
            ),
            LExpr::CallBuiltin { builtin, arguments } => {
                format!("{}({})", builtin.name(), self.list(routine, arguments))
            }
            LExpr::Construct(fields) => format!("({})", self.list(routine, fields)),
            LExpr::Index { target, index } => {
                format!("{}[{}]", self.expr(routine, target), self.expr(routine, index))
            }
            LExpr::Field { target, field } => format!("{}.{}", self.expr(routine, target), field),
            LExpr::Length(target) => format!("len({})", self.expr(routine, target)),
            LExpr::Assign { place, value } => {
                format!("{} := {}", self.place(routine, place), self.expr(routine, value))
            }
            LExpr::Increment {
                place,
                delta,
                prefix,
                ..
            } => {
                let op = if *delta > 0 { "++" } else { "--" };
                let place = self.place(routine, place);
                if *prefix {
                    format!("{}{}", op, place)
                } else {
                    format!("{}{}", place, op)
                }
            }
        }
    }

    fn list(&self, routine: &Routine, expressions: &[LExpr]) -> String {
        expressions
            .iter()
            .map(|expression| self.expr(routine, expression))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn place(&self, routine: &Routine, place: &LPlace) -> String {
        match place {
            LPlace::Local(local) => routine
                .locals
                .get(*local)
                .map_or_else(|| format!("${}", local), |info| info.name.clone()),
            LPlace::Stage { stage, slot } => format!(
                "{}@[{}]",
                self.program.stages[*stage].name,
                self.expr(routine, slot)
            ),
            LPlace::Index { target, index } => {
                format!("{}[{}]", self.place(routine, target), self.expr(routine, index))
            }
            LPlace::Field { target, field } => format!("{}.{}", self.place(routine, target), field),
        }
    }
}

fn constant(value: &Value) -> String {
    match value {
        Value::Float64(v) => format!("{:?}", v),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::lower_source;
    use super::*;

    #[test]
    fn test_listing() {
        let program = lower_source(
            "stage v as int;
             stage a as float[3] holds 1;
             param rate = 0.5;
             func twice(x as int) as int = x * 2;
             operation { v <= twice(v); a[0] <= a[0] + rate; }",
        );
        let listing = print_program(&program);
        assert!(listing.starts_with("program __N1.__C1\n"));
        assert!(listing.contains("stage v: int [full history]"));
        assert!(listing.contains("stage a: float[3] [holds 1]"));
        assert!(listing.contains("param rate: float [cached]"));
        assert!(listing.contains("    return 0.5;"));
        assert!(listing.contains("func twice(x: int) -> int"));
        assert!(listing.contains("entry run() -> nothing"));
        assert!(listing.contains("for now = 0 to max_time - 1"));
        assert!(listing.contains("v@[(now + 1)] := twice(v@[now])"));
    }
}
