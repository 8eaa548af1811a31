//! Executes lowered programs.
//!
//! Stage histories live in [`Globals`] and are reached through the
//! [`Memory`] trait. Sequential code writes straight into the globals.
//! A parallel range hands every iteration an [`OverlayMemory`] over the
//! pre-loop state; each iteration logs its own writes, and the logs are
//! applied in iteration order once every iteration has finished.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

use crate::codegen::ir::{BinaryOp, LExpr, LPlace, LStmt, LType, LocalId, Program, Routine, StageId, UnaryOp};
use crate::error::{RuntimeError, RuntimeResult};
use crate::types::NumericKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Nothing,
    Bool(bool),
    SByte(i8),
    UByte(u8),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Array(Vec<Value>),
    Struct(Vec<Value>),
}

/// One step of a path into a composite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Index(i64),
    Field(usize),
}

impl Value {
    pub fn zero(kind: NumericKind) -> Value {
        Value::from_i64(kind, 0)
    }

    /// Narrows with two's-complement wrapping.
    pub fn from_i64(kind: NumericKind, value: i64) -> Value {
        match kind {
            NumericKind::Bool => Value::Bool(value != 0),
            NumericKind::SByte => Value::SByte(value as i8),
            NumericKind::UByte => Value::UByte(value as u8),
            NumericKind::Int32 => Value::Int32(value as i32),
            NumericKind::Int64 => Value::Int64(value),
            NumericKind::Float64 => Value::Float64(value as f64),
        }
    }

    pub fn from_f64(kind: NumericKind, value: f64) -> Value {
        match kind {
            NumericKind::Float64 => Value::Float64(value),
            NumericKind::Bool => Value::Bool(value != 0.0),
            integral => Value::from_i64(integral, value as i64),
        }
    }

    pub fn numeric_kind(&self) -> Option<NumericKind> {
        match self {
            Value::Bool(_) => Some(NumericKind::Bool),
            Value::SByte(_) => Some(NumericKind::SByte),
            Value::UByte(_) => Some(NumericKind::UByte),
            Value::Int32(_) => Some(NumericKind::Int32),
            Value::Int64(_) => Some(NumericKind::Int64),
            Value::Float64(_) => Some(NumericKind::Float64),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            numeric => numeric.numeric_kind().map_or("value", |kind| kind.name()),
        }
    }

    fn mismatch(&self, expected: &str) -> RuntimeError {
        RuntimeError::TypeMismatch {
            expected: expected.to_string(),
            found: self.type_name().to_string(),
        }
    }

    pub fn as_i64(&self) -> RuntimeResult<i64> {
        match self {
            Value::Bool(b) => Ok(*b as i64),
            Value::SByte(v) => Ok(*v as i64),
            Value::UByte(v) => Ok(*v as i64),
            Value::Int32(v) => Ok(*v as i64),
            Value::Int64(v) => Ok(*v),
            Value::Float64(v) => Ok(*v as i64),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn as_f64(&self) -> RuntimeResult<f64> {
        match self {
            Value::Float64(v) => Ok(*v),
            other => other.as_i64().map(|v| v as f64).map_err(|_| other.mismatch("float")),
        }
    }

    pub fn as_bool(&self) -> RuntimeResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Numeric conversion; composite values pass through unchanged.
    pub fn convert(&self, kind: NumericKind) -> RuntimeResult<Value> {
        match self {
            Value::Float64(v) => Ok(Value::from_f64(kind, *v)),
            Value::Nothing | Value::Array(_) | Value::Struct(_) => Ok(self.clone()),
            other => Ok(Value::from_i64(kind, other.as_i64()?)),
        }
    }

    pub fn len(&self) -> RuntimeResult<usize> {
        match self {
            Value::Array(items) => Ok(items.len()),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Array(items) if items.is_empty())
    }

    fn step(&self, step: Step) -> RuntimeResult<&Value> {
        match (self, step) {
            (Value::Array(items), Step::Index(index)) => usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .ok_or(RuntimeError::IndexOutOfRange {
                    index,
                    len: items.len(),
                }),
            (Value::Struct(fields), Step::Field(field)) => {
                fields.get(field).ok_or_else(|| self.mismatch("struct field"))
            }
            (other, Step::Index(_)) => Err(other.mismatch("array")),
            (other, Step::Field(_)) => Err(other.mismatch("struct")),
        }
    }

    fn step_mut(&mut self, step: Step) -> RuntimeResult<&mut Value> {
        match (self, step) {
            (Value::Array(items), Step::Index(index)) => {
                let len = items.len();
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or(RuntimeError::IndexOutOfRange { index, len })
            }
            (Value::Struct(fields), Step::Field(field)) => {
                fields.get_mut(field).ok_or_else(|| RuntimeError::TypeMismatch {
                    expected: "struct field".to_string(),
                    found: field.to_string(),
                })
            }
            (other, Step::Index(_)) => Err(other.mismatch("array")),
            (other, Step::Field(_)) => Err(other.mismatch("struct")),
        }
    }

    pub fn at(&self, steps: &[Step]) -> RuntimeResult<&Value> {
        steps.iter().try_fold(self, |value, step| value.step(*step))
    }

    pub fn at_mut(&mut self, steps: &[Step]) -> RuntimeResult<&mut Value> {
        steps.iter().try_fold(self, |value, step| value.step_mut(*step))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn list(f: &mut fmt::Formatter, items: &[Value], open: &str, close: &str) -> fmt::Result {
            write!(f, "{}", open)?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", item)?;
            }
            write!(f, "{}", close)
        }

        match self {
            Value::Nothing => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::SByte(v) => write!(f, "{}", v),
            Value::UByte(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Array(items) => list(f, items, "[", "]"),
            Value::Struct(fields) => list(f, fields, "(", ")"),
        }
    }
}

/// Applies a non-short-circuit binary operator to operands already of `kind`.
pub fn apply_binary(op: BinaryOp, kind: NumericKind, left: &Value, right: &Value) -> RuntimeResult<Value> {
    if op.is_comparison() {
        let ordering = if kind == NumericKind::Float64 {
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        } else {
            Some(left.as_i64()?.cmp(&right.as_i64()?))
        };
        let result = match op {
            BinaryOp::Equal => ordering.map_or(false, |o| o.is_eq()),
            BinaryOp::NotEqual => ordering.map_or(true, |o| o.is_ne()),
            BinaryOp::Less => ordering.map_or(false, |o| o.is_lt()),
            BinaryOp::LessOrEqual => ordering.map_or(false, |o| o.is_le()),
            BinaryOp::Greater => ordering.map_or(false, |o| o.is_gt()),
            BinaryOp::GreaterOrEqual => ordering.map_or(false, |o| o.is_ge()),
            _ => unreachable!("{:?} is not a comparison", op),
        };
        return Ok(Value::Bool(result));
    }

    match op {
        BinaryOp::And => Ok(Value::Bool(left.as_bool()? && right.as_bool()?)),
        BinaryOp::Or => Ok(Value::Bool(left.as_bool()? || right.as_bool()?)),
        _ if kind == NumericKind::Float64 => {
            let (a, b) = (left.as_f64()?, right.as_f64()?);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide => a / b,
                BinaryOp::IntegerDivide => (a / b).trunc(),
                BinaryOp::Modulo => a % b,
                _ => unreachable!("{:?} is not arithmetic", op),
            };
            Ok(Value::Float64(result))
        }
        _ => {
            let (a, b) = (left.as_i64()?, right.as_i64()?);
            let result = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Subtract => a.wrapping_sub(b),
                BinaryOp::Multiply => a.wrapping_mul(b),
                BinaryOp::Divide | BinaryOp::IntegerDivide | BinaryOp::Modulo if b == 0 => {
                    return Err(RuntimeError::DivisionByZero)
                }
                BinaryOp::Divide | BinaryOp::IntegerDivide => a.wrapping_div(b),
                BinaryOp::Modulo => a.wrapping_rem(b),
                _ => unreachable!("{:?} is not arithmetic", op),
            };
            Ok(Value::from_i64(kind, result))
        }
    }
}

pub fn apply_unary(op: UnaryOp, kind: NumericKind, operand: &Value) -> RuntimeResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.as_bool()?)),
        UnaryOp::Negate if kind == NumericKind::Float64 => Ok(Value::Float64(-operand.as_f64()?)),
        UnaryOp::Negate => Ok(Value::from_i64(kind, operand.as_i64()?.wrapping_neg())),
    }
}

/// Host services reachable from built-ins: program output and the random source.
pub struct Services {
    output: Mutex<Box<dyn Write + Send>>,
    rng: Mutex<StdRng>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            output: Mutex::new(Box::new(io::stdout())),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Services {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_output(mut self, writer: impl Write + Send + 'static) -> Self {
        self.output = Mutex::new(Box::new(writer));
        self
    }

    /// Redirects output into a buffer the caller can inspect.
    pub fn capture_output(self) -> (Self, CapturedOutput) {
        let captured = CapturedOutput::default();
        (self.with_output(captured.clone()), captured)
    }

    pub fn write_output(&self, text: &str) -> RuntimeResult<()> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output
            .write_all(text.as_bytes())
            .and_then(|_| output.flush())
            .map_err(|e| RuntimeError::Output(e.to_string()))
    }

    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let buffer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSlots {
    pub now: i64,
    pub next: i64,
}

/// Program-wide state of one simulation.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub now: i64,
    pub max_time: i64,
    pub stages: Vec<Value>,
    pub parameters: Vec<Value>,
    pub slots: Vec<StageSlots>,
}

impl Globals {
    pub fn new(program: &Program) -> Self {
        Self {
            now: -1,
            max_time: 0,
            stages: vec![Value::Nothing; program.stages.len()],
            parameters: vec![Value::Nothing; program.parameters.len()],
            slots: vec![StageSlots::default(); program.stages.len()],
        }
    }
}

/// A location inside a stage history; the first step selects the slot.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePath {
    pub stage: StageId,
    pub steps: Vec<Step>,
}

impl StagePath {
    pub fn slot(stage: StageId, slot: i64) -> Self {
        Self {
            stage,
            steps: vec![Step::Index(slot)],
        }
    }

    fn is_prefix_of(&self, other: &StagePath) -> bool {
        self.stage == other.stage && other.steps.starts_with(&self.steps)
    }
}

pub trait Memory: Sync {
    fn globals(&self) -> &Globals;

    /// Mutable globals for host-level statements; `None` inside a parallel iteration.
    fn host(&mut self) -> Option<&mut Globals>;

    fn read(&self, path: &StagePath) -> RuntimeResult<Value>;

    fn write(&mut self, path: StagePath, value: Value) -> RuntimeResult<()>;

    /// Length of the array at `path`.
    fn len(&self, path: &StagePath) -> RuntimeResult<usize> {
        self.read(path)?.len()
    }

    fn is_iteration(&self) -> bool {
        false
    }
}

pub struct DirectMemory<'g> {
    globals: &'g mut Globals,
}

impl<'g> DirectMemory<'g> {
    pub fn new(globals: &'g mut Globals) -> Self {
        Self { globals }
    }
}

impl Memory for DirectMemory<'_> {
    fn globals(&self) -> &Globals {
        &*self.globals
    }

    fn host(&mut self) -> Option<&mut Globals> {
        Some(&mut *self.globals)
    }

    fn read(&self, path: &StagePath) -> RuntimeResult<Value> {
        self.globals.stages[path.stage].at(&path.steps).cloned()
    }

    fn len(&self, path: &StagePath) -> RuntimeResult<usize> {
        self.globals.stages[path.stage].at(&path.steps)?.len()
    }

    fn write(&mut self, path: StagePath, value: Value) -> RuntimeResult<()> {
        *self.globals.stages[path.stage].at_mut(&path.steps)? = value;
        Ok(())
    }
}

/// The view of one parallel iteration: the shared snapshot plus its own writes.
pub struct OverlayMemory<'b> {
    base: &'b dyn Memory,
    writes: Vec<(StagePath, Value)>,
}

impl<'b> OverlayMemory<'b> {
    pub fn new(base: &'b dyn Memory) -> Self {
        Self {
            base,
            writes: Vec::new(),
        }
    }

    pub fn into_writes(self) -> Vec<(StagePath, Value)> {
        self.writes
    }
}

impl Memory for OverlayMemory<'_> {
    fn globals(&self) -> &Globals {
        self.base.globals()
    }

    fn host(&mut self) -> Option<&mut Globals> {
        None
    }

    fn read(&self, path: &StagePath) -> RuntimeResult<Value> {
        let latest = self
            .writes
            .iter()
            .rposition(|(written, _)| written.is_prefix_of(path));

        let (mut value, start) = match latest {
            Some(i) => {
                let (written, value) = &self.writes[i];
                (value.at(&path.steps[written.steps.len()..])?.clone(), i + 1)
            }
            None => (self.base.read(path)?, 0),
        };

        // Later writes below the requested location.
        for (written, update) in &self.writes[start..] {
            if path.is_prefix_of(written) {
                *value.at_mut(&written.steps[path.steps.len()..])? = update.clone();
            }
        }
        Ok(value)
    }

    fn write(&mut self, path: StagePath, value: Value) -> RuntimeResult<()> {
        self.read(&path)?;
        self.writes.push((path, value));
        Ok(())
    }

    fn len(&self, path: &StagePath) -> RuntimeResult<usize> {
        let touched = self
            .writes
            .iter()
            .any(|(written, _)| written.is_prefix_of(path) || path.is_prefix_of(written));
        if touched {
            self.read(path)?.len()
        } else {
            self.base.len(path)
        }
    }

    fn is_iteration(&self) -> bool {
        true
    }
}

pub type TimeObserver = Box<dyn FnMut(i64) + Send>;

enum Flow {
    Normal,
    Break,
    Continue,
    EndIteration,
    Return(Option<Value>),
}

enum Location {
    Local { local: LocalId, steps: Vec<Step> },
    Stage(StagePath),
}

impl Location {
    fn push(&mut self, step: Step) {
        match self {
            Location::Local { steps, .. } => steps.push(step),
            Location::Stage(path) => path.steps.push(step),
        }
    }
}

struct Iteration {
    writes: Vec<(StagePath, Value)>,
    locals: Vec<Value>,
}

fn host(memory: &mut dyn Memory) -> &mut Globals {
    match memory.host() {
        Some(globals) => globals,
        None => unreachable!("host statement executed inside a parallel iteration"),
    }
}

pub struct Executor<'a> {
    program: &'a Program,
    services: &'a Services,
    observers: Option<&'a Mutex<Vec<TimeObserver>>>,
}

impl<'a> Executor<'a> {
    pub fn new(program: &'a Program, services: &'a Services) -> Self {
        Self {
            program,
            services,
            observers: None,
        }
    }

    pub fn with_observers(mut self, observers: &'a Mutex<Vec<TimeObserver>>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn call_routine(&self, routine: &Routine, mut arguments: Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Value> {
        arguments.resize(routine.locals.len().max(arguments.len()), Value::Nothing);
        let mut frame = arguments;

        match self.exec_block(&routine.body, &mut frame, memory)? {
            Flow::Return(Some(value)) => Ok(value),
            _ if routine.returns.is_nothing() => Ok(Value::Nothing),
            _ => Err(RuntimeError::MissingReturn(routine.name.clone())),
        }
    }

    /// A fresh value of `ty` with every array dimension allocated.
    pub fn default_value(&self, ty: &LType, memory: &mut dyn Memory) -> RuntimeResult<Value> {
        self.allocate(ty, &mut Vec::new(), memory)
    }

    fn allocate(&self, ty: &LType, frame: &mut Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Value> {
        match ty {
            LType::Nothing => Ok(Value::Nothing),
            LType::Numeric(kind) => Ok(Value::zero(*kind)),
            LType::Struct { fields, .. } => fields
                .iter()
                .map(|field| self.allocate(field, frame, memory))
                .collect::<RuntimeResult<Vec<_>>>()
                .map(Value::Struct),
            LType::Array { size: None, .. } => Ok(Value::Array(Vec::new())),
            LType::Array {
                element,
                size: Some(size),
            } => {
                let len = self.eval(size, frame, memory)?.as_i64()?;
                let len = usize::try_from(len).map_err(|_| RuntimeError::NegativeSize(len))?;
                let element = self.allocate(element, frame, memory)?;
                let items = if self.program.parallel_allocation && !matches!(element, Value::Nothing) {
                    (0..len).into_par_iter().map(|_| element.clone()).collect()
                } else {
                    vec![element; len]
                };
                Ok(Value::Array(items))
            }
        }
    }

    fn exec_block(&self, statements: &[LStmt], frame: &mut Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Flow> {
        for statement in statements {
            match self.exec(statement, frame, memory)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&self, statement: &LStmt, frame: &mut Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Flow> {
        match statement {
            LStmt::Expr(expression) => {
                self.eval(expression, frame, memory)?;
            }
            LStmt::DeclareLocal { local, ty, init } => {
                let value = match init {
                    Some(init) => self.eval(init, frame, memory)?,
                    None => self.allocate(ty, frame, memory)?,
                };
                frame[*local] = value;
            }
            LStmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let branch = if self.eval(condition, frame, memory)?.as_bool()? {
                    then_branch
                } else {
                    else_branch
                };
                return self.exec_block(branch, frame, memory);
            }
            LStmt::While { condition, body } => {
                while self.eval(condition, frame, memory)?.as_bool()? {
                    match self.exec_block(body, frame, memory)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        other => return Ok(other),
                    }
                }
            }
            LStmt::Range {
                local,
                from,
                to,
                body,
                parallel,
                fan_out,
                shared_locals,
            } => {
                let from = self.eval(from, frame, memory)?.as_i64()?;
                let to = self.eval(to, frame, memory)?.as_i64()?;
                if *parallel && *fan_out && !memory.is_iteration() {
                    self.fan_out(*local, from, to, body, *shared_locals, frame, memory)?;
                } else {
                    return self.exec_range(*local, from, to, body, *parallel, frame, memory);
                }
            }
            LStmt::Return(value) => {
                let value = match value {
                    Some(value) => Some(self.eval(value, frame, memory)?),
                    None => None,
                };
                return Ok(Flow::Return(value));
            }
            LStmt::Break => return Ok(Flow::Break),
            LStmt::Continue => return Ok(Flow::Continue),
            LStmt::EndIteration => return Ok(Flow::EndIteration),
            LStmt::AllocateStage(stage) => {
                let layout = &self.program.stages[*stage];
                let element = if layout.allocates {
                    Value::Nothing
                } else {
                    self.allocate(&layout.ty, frame, memory)?
                };
                let globals = host(memory);
                let max_time = usize::try_from(globals.max_time).unwrap_or(0);
                let too_large = |len| RuntimeError::HistoryTooLarge {
                    stage: layout.name.clone(),
                    len,
                };
                let len = layout.hold.allocation_len(max_time).ok_or_else(|| too_large(usize::MAX))?;
                let mut slots = Vec::new();
                slots.try_reserve_exact(len).map_err(|_| too_large(len))?;
                slots.resize(len, element);
                globals.stages[*stage] = Value::Array(slots);
            }
            LStmt::Allocate { stage, slot, guard } => {
                if let Some(guard) = guard {
                    if !self.eval(guard, frame, memory)?.as_bool()? {
                        return Ok(Flow::Normal);
                    }
                }
                let slot = self.eval(slot, frame, memory)?.as_i64()?;
                let element = self.allocate(&self.program.stages[*stage].ty, frame, memory)?;
                memory.write(StagePath::slot(*stage, slot), element)?;
            }
            LStmt::SetNow(now) => {
                let now = self.eval(now, frame, memory)?.as_i64()?;
                host(memory).now = now;
            }
            LStmt::ForEachTick(body) => {
                let max_time = memory.globals().max_time;
                for now in 0..max_time {
                    host(memory).now = now;
                    trace!(now, "tick");
                    self.exec_block(body, frame, memory)?;
                }
            }
            LStmt::NotifyTimeChanged => {
                if let Some(observers) = self.observers {
                    let now = memory.globals().now;
                    let mut observers = observers.lock().unwrap_or_else(PoisonError::into_inner);
                    for observer in observers.iter_mut() {
                        observer(now);
                    }
                }
            }
            LStmt::CacheParameter(param) => {
                let layout = &self.program.parameters[*param];
                let Some(routine) = layout.routine() else {
                    unreachable!("external parameter '{}' has no routine to cache", layout.name);
                };
                let value = self.call_routine(routine, Vec::new(), memory)?;
                host(memory).parameters[*param] = value;
            }
            LStmt::CacheStage(stage) => {
                let hold = self.program.stages[*stage].hold;
                let globals = host(memory);
                globals.slots[*stage] = StageSlots {
                    now: hold.slot(globals.now),
                    next: hold.slot(globals.now + 1),
                };
            }
        }
        Ok(Flow::Normal)
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_range(
        &self,
        local: LocalId,
        from: i64,
        to: i64,
        body: &[LStmt],
        parallel: bool,
        frame: &mut Vec<Value>,
        memory: &mut dyn Memory,
    ) -> RuntimeResult<Flow> {
        let mut index = from;
        while index <= to {
            frame[local] = Value::Int32(index as i32);
            match self.exec_block(body, frame, memory)? {
                Flow::Break => break,
                Flow::Normal | Flow::Continue => {}
                Flow::EndIteration if parallel => {}
                other => return Ok(other),
            }
            index = if parallel {
                index + 1
            } else {
                frame[local].as_i64()? + 1
            };
        }
        Ok(Flow::Normal)
    }

    /// Runs every iteration against the pre-loop state, then applies the
    /// iterations' writes in iteration order. Writes to locals declared
    /// before the loop follow the same rule.
    #[allow(clippy::too_many_arguments)]
    fn fan_out(
        &self,
        local: LocalId,
        from: i64,
        to: i64,
        body: &[LStmt],
        shared_locals: usize,
        frame: &mut Vec<Value>,
        memory: &mut dyn Memory,
    ) -> RuntimeResult<()> {
        let count = usize::try_from(to - from + 1).unwrap_or(0);
        let snapshot: &dyn Memory = &*memory;
        let base: &Vec<Value> = &*frame;

        let iterations: Vec<RuntimeResult<Iteration>> = (0..count)
            .into_par_iter()
            .map(|offset| {
                let mut overlay = OverlayMemory::new(snapshot);
                let mut locals = base.clone();
                locals[local] = Value::Int32((from + offset as i64) as i32);
                self.exec_block(body, &mut locals, &mut overlay)?;
                Ok(Iteration {
                    writes: overlay.into_writes(),
                    locals,
                })
            })
            .collect();

        // A failed iteration leaves the pre-loop state untouched.
        let iterations = iterations.into_iter().collect::<RuntimeResult<Vec<_>>>()?;

        let original: Vec<Value> = frame[..shared_locals].to_vec();
        for iteration in iterations {
            for (path, value) in iteration.writes {
                memory.write(path, value)?;
            }
            for (id, value) in iteration.locals.into_iter().take(shared_locals).enumerate() {
                if value != original[id] {
                    frame[id] = value;
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, place: &LPlace, frame: &mut Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Location> {
        match place {
            LPlace::Local(local) => Ok(Location::Local {
                local: *local,
                steps: Vec::new(),
            }),
            LPlace::Stage { stage, slot } => {
                let slot = self.eval(slot, frame, memory)?.as_i64()?;
                Ok(Location::Stage(StagePath::slot(*stage, slot)))
            }
            LPlace::Index { target, index } => {
                let mut location = self.resolve(target, frame, memory)?;
                let index = self.eval(index, frame, memory)?.as_i64()?;
                location.push(Step::Index(index));
                Ok(location)
            }
            LPlace::Field { target, field } => {
                let mut location = self.resolve(target, frame, memory)?;
                location.push(Step::Field(*field));
                Ok(location)
            }
        }
    }

    fn read(&self, location: &Location, frame: &[Value], memory: &dyn Memory) -> RuntimeResult<Value> {
        match location {
            Location::Local { local, steps } => frame[*local].at(steps).cloned(),
            Location::Stage(path) => memory.read(path),
        }
    }

    fn length(&self, location: &Location, frame: &[Value], memory: &dyn Memory) -> RuntimeResult<usize> {
        match location {
            Location::Local { local, steps } => frame[*local].at(steps)?.len(),
            Location::Stage(path) => memory.len(path),
        }
    }

    fn write(&self, location: Location, value: Value, frame: &mut [Value], memory: &mut dyn Memory) -> RuntimeResult<()> {
        match location {
            Location::Local { local, steps } => {
                *frame[local].at_mut(&steps)? = value;
                Ok(())
            }
            Location::Stage(path) => memory.write(path, value),
        }
    }

    fn eval_all(&self, expressions: &[LExpr], frame: &mut Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Vec<Value>> {
        expressions
            .iter()
            .map(|expression| self.eval(expression, frame, memory))
            .collect()
    }

    pub(crate) fn eval(&self, expression: &LExpr, frame: &mut Vec<Value>, memory: &mut dyn Memory) -> RuntimeResult<Value> {
        match expression {
            LExpr::Const(value) => Ok(value.clone()),
            LExpr::Now => Ok(Value::Int32(memory.globals().now as i32)),
            LExpr::MaxTime => Ok(Value::Int32(memory.globals().max_time as i32)),
            LExpr::Load(place) => {
                let location = self.resolve(place, frame, memory)?;
                self.read(&location, frame, memory)
            }
            LExpr::Parameter(param) => Ok(memory.globals().parameters[*param].clone()),
            LExpr::EvaluateParameter(param) => {
                let layout = &self.program.parameters[*param];
                let Some(routine) = layout.routine() else {
                    unreachable!("external parameter '{}' has no routine", layout.name);
                };
                self.call_routine(routine, Vec::new(), memory)
            }
            LExpr::StageSlot { stage, next } => {
                let slots = memory.globals().slots[*stage];
                let slot = if *next { slots.next } else { slots.now };
                Ok(Value::Int32(slot as i32))
            }
            LExpr::Unary { op, operand, kind } => {
                let operand = self.eval(operand, frame, memory)?;
                apply_unary(*op, *kind, &operand)
            }
            LExpr::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                left,
                right,
                ..
            } => {
                let left = self.eval(left, frame, memory)?.as_bool()?;
                if left == (*op == BinaryOp::Or) {
                    return Ok(Value::Bool(left));
                }
                Ok(Value::Bool(self.eval(right, frame, memory)?.as_bool()?))
            }
            LExpr::Binary {
                op,
                left,
                right,
                kind,
            } => {
                let left = self.eval(left, frame, memory)?;
                let right = self.eval(right, frame, memory)?;
                apply_binary(*op, *kind, &left, &right)
            }
            LExpr::Convert { operand, kind } => self.eval(operand, frame, memory)?.convert(*kind),
            LExpr::Conditional {
                condition,
                if_true,
                if_false,
            } => {
                if self.eval(condition, frame, memory)?.as_bool()? {
                    self.eval(if_true, frame, memory)
                } else {
                    self.eval(if_false, frame, memory)
                }
            }
            LExpr::Call {
                function,
                arguments,
            } => {
                let arguments = self.eval_all(arguments, frame, memory)?;
                self.call_routine(&self.program.functions[*function], arguments, memory)
            }
            LExpr::CallBuiltin { builtin, arguments } => {
                let arguments = self.eval_all(arguments, frame, memory)?;
                builtin.invoke(&arguments, self.services)
            }
            LExpr::Construct(fields) => Ok(Value::Struct(self.eval_all(fields, frame, memory)?)),
            LExpr::Index { target, index } => {
                let target = self.eval(target, frame, memory)?;
                let index = self.eval(index, frame, memory)?.as_i64()?;
                target.at(&[Step::Index(index)]).cloned()
            }
            LExpr::Field { target, field } => {
                let target = self.eval(target, frame, memory)?;
                target.at(&[Step::Field(*field)]).cloned()
            }
            LExpr::Length(target) => {
                let len = match target.as_ref() {
                    LExpr::Load(place) => {
                        let location = self.resolve(place, frame, memory)?;
                        self.length(&location, frame, memory)?
                    }
                    other => self.eval(other, frame, memory)?.len()?,
                };
                Ok(Value::Int32(len as i32))
            }
            LExpr::Assign { place, value } => {
                let location = self.resolve(place, frame, memory)?;
                let value = self.eval(value, frame, memory)?;
                self.write(location, value.clone(), frame, memory)?;
                Ok(value)
            }
            LExpr::Increment {
                place,
                delta,
                prefix,
                kind,
            } => {
                let location = self.resolve(place, frame, memory)?;
                let old = self.read(&location, frame, memory)?;
                let new = apply_binary(BinaryOp::Add, *kind, &old, &Value::from_i64(*kind, *delta))?;
                self.write(location, new.clone(), frame, memory)?;
                Ok(if *prefix { new } else { old })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hold_state::HoldState;
    use crate::codegen::ir::{LocalInfo, StageLayout};

    fn stage_program() -> Program {
        let element = LType::Array {
            element: Box::new(LType::Numeric(NumericKind::Int32)),
            size: Some(Box::new(LExpr::int32(4))),
        };
        Program {
            name: "test".to_string(),
            stages: vec![StageLayout {
                name: "a".to_string(),
                ty: element,
                hold: HoldState::FullHistory,
                allocates: true,
                reusable: true,
            }],
            parameters: Vec::new(),
            functions: Vec::new(),
            structs: Vec::new(),
            initialize: Routine::new("initialize", LType::Nothing),
            run: Routine::new("run", LType::Nothing),
            parallel_allocation: false,
        }
    }

    fn element_place(slot: i64, index: LExpr) -> LPlace {
        LPlace::Index {
            target: Box::new(LPlace::Stage {
                stage: 0,
                slot: Box::new(LExpr::Const(Value::Int64(slot))),
            }),
            index: Box::new(index),
        }
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        let result = apply_binary(BinaryOp::Add, NumericKind::SByte, &Value::SByte(127), &Value::SByte(1)).unwrap();
        assert_eq!(result, Value::SByte(-128));
        let result = apply_binary(BinaryOp::Subtract, NumericKind::UByte, &Value::UByte(0), &Value::UByte(1)).unwrap();
        assert_eq!(result, Value::UByte(255));
        let result = apply_binary(BinaryOp::Multiply, NumericKind::Int32, &Value::Int32(i32::MAX), &Value::Int32(2)).unwrap();
        assert_eq!(result, Value::Int32(-2));
    }

    #[test]
    fn test_integer_division() {
        let result = apply_binary(BinaryOp::IntegerDivide, NumericKind::Int32, &Value::Int32(-7), &Value::Int32(2)).unwrap();
        assert_eq!(result, Value::Int32(-3));
        let result = apply_binary(BinaryOp::Modulo, NumericKind::Int32, &Value::Int32(-7), &Value::Int32(2)).unwrap();
        assert_eq!(result, Value::Int32(-1));
        let error = apply_binary(BinaryOp::Modulo, NumericKind::Int64, &Value::Int64(1), &Value::Int64(0)).unwrap_err();
        assert_eq!(error, RuntimeError::DivisionByZero);
        let result = apply_binary(BinaryOp::Divide, NumericKind::Float64, &Value::Float64(1.0), &Value::Float64(0.0)).unwrap();
        assert!(matches!(result, Value::Float64(v) if v.is_infinite()));
    }

    #[test]
    fn test_comparisons_and_conversions() {
        let less = apply_binary(BinaryOp::Less, NumericKind::Float64, &Value::Float64(1.5), &Value::Float64(2.0)).unwrap();
        assert_eq!(less, Value::Bool(true));
        assert_eq!(Value::Float64(3.9).convert(NumericKind::Int32).unwrap(), Value::Int32(3));
        assert_eq!(Value::Int32(300).convert(NumericKind::UByte).unwrap(), Value::UByte(44));
        assert_eq!(Value::Bool(true).convert(NumericKind::Float64).unwrap(), Value::Float64(1.0));
        assert_eq!(Value::Int32(2).convert(NumericKind::Bool).unwrap(), Value::Bool(true));
        assert!(Value::Array(vec![]).as_i64().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float64(2.5).to_string(), "2.5");
        assert_eq!(Value::Float64(3.0).to_string(), "3");
        assert_eq!(
            Value::Array(vec![Value::Int32(1), Value::Struct(vec![Value::Bool(true)])]).to_string(),
            "[1, (true)]"
        );
    }

    #[test]
    fn test_paths() {
        let mut value = Value::Array(vec![Value::Struct(vec![Value::Int32(1), Value::Int32(2)])]);
        assert_eq!(value.at(&[Step::Index(0), Step::Field(1)]).unwrap(), &Value::Int32(2));
        *value.at_mut(&[Step::Index(0), Step::Field(0)]).unwrap() = Value::Int32(9);
        assert_eq!(value.at(&[Step::Index(0), Step::Field(0)]).unwrap(), &Value::Int32(9));
        assert_eq!(
            value.at(&[Step::Index(3)]).unwrap_err(),
            RuntimeError::IndexOutOfRange { index: 3, len: 1 }
        );
        assert!(value.at(&[Step::Index(-1)]).is_err());
    }

    #[test]
    fn test_overlay_merges_writes_over_snapshot() {
        let mut globals = Globals::default();
        globals.stages.push(Value::Array(vec![Value::Array(vec![Value::Int32(0); 3])]));
        let direct = DirectMemory::new(&mut globals);

        let mut overlay = OverlayMemory::new(&direct);
        let element = |i| StagePath {
            stage: 0,
            steps: vec![Step::Index(0), Step::Index(i)],
        };
        overlay.write(element(1), Value::Int32(5)).unwrap();
        assert_eq!(overlay.read(&element(1)).unwrap(), Value::Int32(5));
        assert_eq!(
            overlay.read(&StagePath::slot(0, 0)).unwrap(),
            Value::Array(vec![Value::Int32(0), Value::Int32(5), Value::Int32(0)])
        );

        overlay
            .write(StagePath::slot(0, 0), Value::Array(vec![Value::Int32(7); 3]))
            .unwrap();
        overlay.write(element(2), Value::Int32(8)).unwrap();
        assert_eq!(overlay.read(&element(0)).unwrap(), Value::Int32(7));
        assert_eq!(overlay.read(&element(2)).unwrap(), Value::Int32(8));
        assert!(overlay.write(element(3), Value::Int32(1)).is_err());

        // The snapshot itself is untouched.
        assert_eq!(direct.read(&element(1)).unwrap(), Value::Int32(0));
    }

    #[test]
    fn test_fan_out_applies_writes_in_iteration_order() {
        let program = stage_program();
        let services = Services::default();
        let executor = Executor::new(&program, &services);
        let mut globals = Globals::new(&program);
        globals.max_time = 1;

        // a[0][i] = 1 for every i, and a[0][0] = i (last iteration wins).
        let body = vec![
            LStmt::Expr(LExpr::Assign {
                place: element_place(0, LExpr::local(1)),
                value: Box::new(LExpr::int32(1)),
            }),
            LStmt::Expr(LExpr::Assign {
                place: element_place(0, LExpr::int32(0)),
                value: Box::new(LExpr::local(1)),
            }),
            LStmt::Expr(LExpr::Assign {
                place: LPlace::Local(0),
                value: Box::new(LExpr::local(1)),
            }),
        ];
        let mut routine = Routine::new("run", LType::Nothing);
        routine.locals = vec![
            LocalInfo {
                name: "last".to_string(),
                ty: LType::Numeric(NumericKind::Int32),
            },
            LocalInfo {
                name: "i".to_string(),
                ty: LType::Numeric(NumericKind::Int32),
            },
        ];
        routine.body = vec![
            LStmt::AllocateStage(0),
            LStmt::Allocate {
                stage: 0,
                slot: LExpr::int32(0),
                guard: None,
            },
            LStmt::DeclareLocal {
                local: 0,
                ty: LType::Numeric(NumericKind::Int32),
                init: Some(LExpr::int32(-1)),
            },
            LStmt::Range {
                local: 1,
                from: LExpr::int32(1),
                to: LExpr::int32(3),
                body,
                parallel: true,
                fan_out: true,
                shared_locals: 1,
            },
            LStmt::Return(None),
        ];

        let mut memory = DirectMemory::new(&mut globals);
        executor.call_routine(&routine, Vec::new(), &mut memory).unwrap();
        assert_eq!(
            globals.stages[0],
            Value::Array(vec![
                Value::Array(vec![Value::Int32(3), Value::Int32(1), Value::Int32(1), Value::Int32(1)]),
                Value::Nothing,
            ])
        );
    }

    #[test]
    fn test_overlay_length() {
        let mut globals = Globals::default();
        globals.stages.push(Value::Array(vec![Value::Array(vec![Value::Int32(0); 3])]));
        let direct = DirectMemory::new(&mut globals);
        assert_eq!(direct.len(&StagePath::slot(0, 0)).unwrap(), 3);

        let mut overlay = OverlayMemory::new(&direct);
        assert_eq!(overlay.len(&StagePath::slot(0, 0)).unwrap(), 3);
        overlay
            .write(StagePath::slot(0, 0), Value::Array(vec![Value::Int32(1); 5]))
            .unwrap();
        assert_eq!(overlay.len(&StagePath::slot(0, 0)).unwrap(), 5);
        assert_eq!(direct.len(&StagePath::slot(0, 0)).unwrap(), 3);
        assert!(matches!(
            direct.len(&StagePath::slot(0, 1)),
            Err(RuntimeError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_failed_fan_out_applies_no_writes() {
        let program = stage_program();
        let services = Services::default();
        let executor = Executor::new(&program, &services);
        let mut globals = Globals::new(&program);
        globals.max_time = 1;

        // Iterations 2 and 3 succeed, iteration 4 indexes past the end.
        let body = vec![LStmt::Expr(LExpr::Assign {
            place: element_place(0, LExpr::local(0)),
            value: Box::new(LExpr::int32(9)),
        })];
        let mut routine = Routine::new("run", LType::Nothing);
        routine.locals = vec![LocalInfo {
            name: "i".to_string(),
            ty: LType::Numeric(NumericKind::Int32),
        }];
        routine.body = vec![
            LStmt::AllocateStage(0),
            LStmt::Allocate {
                stage: 0,
                slot: LExpr::int32(0),
                guard: None,
            },
            LStmt::Range {
                local: 0,
                from: LExpr::int32(2),
                to: LExpr::int32(4),
                body,
                parallel: true,
                fan_out: true,
                shared_locals: 0,
            },
            LStmt::Return(None),
        ];

        let mut memory = DirectMemory::new(&mut globals);
        assert!(matches!(
            executor.call_routine(&routine, Vec::new(), &mut memory),
            Err(RuntimeError::IndexOutOfRange { index: 4, len: 4 })
        ));
        assert_eq!(
            globals.stages[0],
            Value::Array(vec![Value::Array(vec![Value::Int32(0); 4]), Value::Nothing])
        );
    }

    #[test]
    fn test_oversized_history_is_an_error() {
        let mut program = stage_program();
        program.run.body = vec![LStmt::AllocateStage(0), LStmt::Return(None)];
        let services = Services::default();
        let executor = Executor::new(&program, &services);
        let mut globals = Globals::new(&program);
        globals.max_time = i64::MAX;

        let mut memory = DirectMemory::new(&mut globals);
        assert!(matches!(
            executor.call_routine(&program.run, Vec::new(), &mut memory),
            Err(RuntimeError::HistoryTooLarge { ref stage, .. }) if stage == "a"
        ));
    }

    #[test]
    fn test_missing_return_is_reported() {
        let program = stage_program();
        let services = Services::default();
        let executor = Executor::new(&program, &services);
        let mut globals = Globals::new(&program);
        let routine = Routine::new("f", LType::Numeric(NumericKind::Int32));
        let error = executor
            .call_routine(&routine, Vec::new(), &mut DirectMemory::new(&mut globals))
            .unwrap_err();
        assert_eq!(error, RuntimeError::MissingReturn("f".to_string()));
    }
}
