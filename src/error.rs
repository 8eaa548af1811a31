use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Zero-based source location. Two sentinels mark positions that do not point
/// into the source: `INVALID` and `END_OF_INPUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const END_OF_INPUT: Position = Position {
        line: usize::MAX - 1,
        column: usize::MAX - 1,
    };
    pub const INVALID: Position = Position {
        line: usize::MAX,
        column: usize::MAX,
    };

    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    pub fn is_end_of_input(&self) -> bool {
        *self == Self::END_OF_INPUT
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "<invalid>")
        } else if self.is_end_of_input() {
            write!(f, "<end of input>")
        } else {
            write!(f, "{}:{}", self.line + 1, self.column + 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    Lexical,
    Syntax,
    Name,
    Type,
    Context,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DiagnosticKind::Lexical => "lexical",
            DiagnosticKind::Syntax => "syntax",
            DiagnosticKind::Name => "name",
            DiagnosticKind::Type => "type",
            DiagnosticKind::Context => "context",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub position: Position,
    pub message: String,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, position: Position, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            position,
            message: message.into(),
        }
    }

    pub fn warning(kind: DiagnosticKind, position: Position, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            kind,
            position,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}: {} {}: {}", self.position, self.kind, severity, self.message)
    }
}

/// Accumulates every diagnostic of one compile invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn error(&mut self, kind: DiagnosticKind, position: Position, message: impl Into<String>) {
        self.push(Diagnostic::error(kind, position, message));
    }

    pub fn warning(&mut self, kind: DiagnosticKind, position: Position, message: impl Into<String>) {
        self.push(Diagnostic::warning(kind, position, message));
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter().filter(|d| !d.is_error())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drops diagnostics reported after the first `len`.
    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_of(&self, kind: DiagnosticKind) -> usize {
        self.errors().filter(|d| d.kind == kind).count()
    }

    /// Stable sort, so diagnostics at the same position keep their report order.
    pub fn sort_by_position(&mut self) {
        self.items.sort_by_key(|d| d.position);
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for diagnostic in &self.items {
            writeln!(f, "{}", diagnostic)?;
        }
        Ok(())
    }
}

// Runtime Errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("index {index} is out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("cannot allocate {len} history slots for stage '{stage}'")]
    HistoryTooLarge { stage: String, len: usize },
    #[error("negative array size {0}")]
    NegativeSize(i64),
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("parameter '{0}' is computed by the program and cannot be set")]
    NotAssignable(String),
    #[error("expected a value of type {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("function '{0}' finished without returning a value")]
    MissingReturn(String),
    #[error("simulation has not been initialized")]
    NotInitialized,
    #[error("simulation has already been initialized")]
    AlreadyInitialized,
    #[error("failed to write program output: {0}")]
    Output(String),
}

// Compilation Errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with {} error(s)", .0.errors().count())]
    Diagnostics(Diagnostics),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Usage(String),
}

impl From<Diagnostics> for CompileError {
    fn from(diagnostics: Diagnostics) -> Self {
        CompileError::Diagnostics(diagnostics)
    }
}

// Result types
pub type RuntimeResult<T> = Result<T, RuntimeError>;
pub type CompileResult<T> = Result<T, CompileError>;
