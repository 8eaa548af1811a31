//! The lowered program: flat routines over explicit places, with every
//! implicit conversion and every stage time rewrite already applied.

use crate::hold_state::HoldState;
use crate::library::Builtin;
use crate::runtime::Value;
use crate::types::NumericKind;

pub type LocalId = usize;
pub type StageId = usize;
pub type ParamId = usize;
pub type FunctionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessOrEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterOrEqual
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::IntegerDivide => "idiv",
            BinaryOp::Modulo => "mod",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessOrEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterOrEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// A storage location.
#[derive(Debug, Clone, PartialEq)]
pub enum LPlace {
    Local(LocalId),
    /// One slot of a stage's history.
    Stage {
        stage: StageId,
        slot: Box<LExpr>,
    },
    Index {
        target: Box<LPlace>,
        index: Box<LExpr>,
    },
    Field {
        target: Box<LPlace>,
        field: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LExpr {
    Const(Value),
    Now,
    MaxTime,
    Load(LPlace),
    /// Cached or externally supplied parameter value.
    Parameter(ParamId),
    /// Parameter recomputed at the point of use.
    EvaluateParameter(ParamId),
    /// The storage slot of `now` (or `next`) computed once per tick.
    StageSlot {
        stage: StageId,
        next: bool,
    },
    Unary {
        op: UnaryOp,
        operand: Box<LExpr>,
        kind: NumericKind,
    },
    /// Both operands are already of `kind`.
    Binary {
        op: BinaryOp,
        left: Box<LExpr>,
        right: Box<LExpr>,
        kind: NumericKind,
    },
    Convert {
        operand: Box<LExpr>,
        kind: NumericKind,
    },
    Conditional {
        condition: Box<LExpr>,
        if_true: Box<LExpr>,
        if_false: Box<LExpr>,
    },
    Call {
        function: FunctionId,
        arguments: Vec<LExpr>,
    },
    CallBuiltin {
        builtin: Builtin,
        arguments: Vec<LExpr>,
    },
    Construct(Vec<LExpr>),
    Index {
        target: Box<LExpr>,
        index: Box<LExpr>,
    },
    Field {
        target: Box<LExpr>,
        field: usize,
    },
    Length(Box<LExpr>),
    Assign {
        place: LPlace,
        value: Box<LExpr>,
    },
    Increment {
        place: LPlace,
        delta: i64,
        prefix: bool,
        kind: NumericKind,
    },
}

impl LExpr {
    pub fn int32(value: i32) -> LExpr {
        LExpr::Const(Value::Int32(value))
    }

    pub fn local(local: LocalId) -> LExpr {
        LExpr::Load(LPlace::Local(local))
    }

    pub fn binary(op: BinaryOp, left: LExpr, right: LExpr, kind: NumericKind) -> LExpr {
        LExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            kind,
        }
    }

    /// A comparison; `operand_kind` is the kind both sides are compared in.
    pub fn compare(op: BinaryOp, left: LExpr, right: LExpr, operand_kind: NumericKind) -> LExpr {
        debug_assert!(op.is_comparison());
        Self::binary(op, left, right, operand_kind)
    }

    pub fn convert(operand: LExpr, kind: NumericKind) -> LExpr {
        LExpr::Convert {
            operand: Box::new(operand),
            kind,
        }
    }

    pub fn as_const(&self) -> Option<&Value> {
        match self {
            LExpr::Const(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LStmt {
    Expr(LExpr),
    /// Declares a local; without an initializer it gets a fresh default value of `ty`.
    DeclareLocal {
        local: LocalId,
        ty: LType,
        init: Option<LExpr>,
    },
    If {
        condition: LExpr,
        then_branch: Vec<LStmt>,
        else_branch: Vec<LStmt>,
    },
    While {
        condition: LExpr,
        body: Vec<LStmt>,
    },
    /// Counts `local` from `from` to `to` inclusive. A `parallel` range runs
    /// each iteration as an independent unit of work; `fan_out` says whether
    /// those units may run concurrently.
    Range {
        local: LocalId,
        from: LExpr,
        to: LExpr,
        body: Vec<LStmt>,
        parallel: bool,
        fan_out: bool,
        shared_locals: usize,
    },
    Return(Option<LExpr>),
    Break,
    Continue,
    /// Leaves the body of the innermost parallel iteration.
    EndIteration,
    /// Creates the history buffer of a stage.
    AllocateStage(StageId),
    /// Materializes a fresh element in one history slot.
    Allocate {
        stage: StageId,
        slot: LExpr,
        guard: Option<LExpr>,
    },
    SetNow(LExpr),
    /// Runs `body` once for every tick in `0..max_time`.
    ForEachTick(Vec<LStmt>),
    NotifyTimeChanged,
    CacheParameter(ParamId),
    CacheStage(StageId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LType {
    Nothing,
    Numeric(NumericKind),
    Array {
        element: Box<LType>,
        size: Option<Box<LExpr>>,
    },
    Struct {
        name: String,
        fields: Vec<LType>,
    },
}

impl LType {
    pub fn as_numeric(&self) -> Option<NumericKind> {
        match self {
            LType::Numeric(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, LType::Nothing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalInfo {
    pub name: String,
    pub ty: LType,
}

/// A callable body. The first `params` locals receive the arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub name: String,
    pub params: usize,
    pub locals: Vec<LocalInfo>,
    pub returns: LType,
    pub body: Vec<LStmt>,
}

impl Routine {
    pub fn new(name: impl Into<String>, returns: LType) -> Self {
        Self {
            name: name.into(),
            params: 0,
            locals: Vec::new(),
            returns,
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageLayout {
    pub name: String,
    /// Type of one history element.
    pub ty: LType,
    pub hold: HoldState,
    /// Elements need a fresh allocation before they are written.
    pub allocates: bool,
    pub reusable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterSource {
    /// Set by the host before initialization.
    External,
    /// Evaluated once per run and read from the cache.
    Cached(Routine),
    /// Evaluated at every read.
    Computed(Routine),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterLayout {
    pub name: String,
    pub ty: LType,
    pub source: ParameterSource,
}

impl ParameterLayout {
    pub fn routine(&self) -> Option<&Routine> {
        match &self.source {
            ParameterSource::External => None,
            ParameterSource::Cached(routine) | ParameterSource::Computed(routine) => Some(routine),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<(String, LType)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub stages: Vec<StageLayout>,
    pub parameters: Vec<ParameterLayout>,
    pub functions: Vec<Routine>,
    pub structs: Vec<StructLayout>,
    pub initialize: Routine,
    pub run: Routine,
    pub parallel_allocation: bool,
}

impl Program {
    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    pub fn parameter_id(&self, name: &str) -> Option<ParamId> {
        self.parameters.iter().position(|param| param.name == name)
    }

    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.functions.iter().position(|function| function.name == name)
    }
}
