//! The compile driver: lex, parse, infer and check, then lower when no
//! error was reported.

use std::fs;
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::codegen::{self, ir::Program};
use crate::error::{CompileError, CompileResult, Diagnostics};
use crate::options::CompileOptions;
use crate::parser::parse_source;
use crate::type_checker::{InferenceReport, TypeChecker};

/// Everything one compile produced. `program` is present only when
/// `diagnostics` holds no errors.
#[derive(Debug)]
pub struct Compilation {
    pub diagnostics: Diagnostics,
    pub inference: InferenceReport,
    pub program: Option<Program>,
}

impl Compilation {
    pub fn succeeded(&self) -> bool {
        self.program.is_some()
    }

    /// The lowered program, or the diagnostics when the compile failed.
    pub fn into_result(self) -> CompileResult<Program> {
        match self.program {
            Some(program) => Ok(program),
            None => Err(CompileError::Diagnostics(self.diagnostics)),
        }
    }
}

#[instrument(skip(source, options), fields(bytes = source.len()))]
pub fn compile(source: &str, options: &CompileOptions) -> Compilation {
    let (mut unit, mut diagnostics) = parse_source(source, options);
    let (inference, checked) = TypeChecker::new().check_program(&mut unit);
    diagnostics.extend(checked);
    diagnostics.sort_by_position();

    let errors = diagnostics.errors().count();
    let warnings = diagnostics.warnings().count();
    if errors > 0 {
        warn!(errors, warnings, "compilation failed");
        return Compilation {
            diagnostics,
            inference,
            program: None,
        };
    }

    let program = codegen::lower(&unit, options);
    info!(
        warnings,
        passes = inference.passes,
        program = %program.name,
        "compilation succeeded"
    );
    Compilation {
        diagnostics,
        inference,
        program: Some(program),
    }
}

/// Compiles `source`, failing with the diagnostics on any error.
pub fn compile_program(source: &str, options: &CompileOptions) -> CompileResult<Program> {
    compile(source, options).into_result()
}

pub fn compile_file(path: impl AsRef<Path>, options: &CompileOptions) -> CompileResult<Compilation> {
    let source = fs::read_to_string(path)?;
    Ok(compile(&source, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticKind;

    #[test]
    fn test_errors_gate_lowering() {
        let compilation = compile("stage v as int; operation { v <= w; }", &CompileOptions::default());
        assert!(!compilation.succeeded());
        assert_eq!(compilation.diagnostics.count_of(DiagnosticKind::Name), 1);
        assert!(matches!(compilation.into_result(), Err(CompileError::Diagnostics(_))));
    }

    #[test]
    fn test_warnings_do_not_gate() {
        let compilation = compile("func f() as int { var unused = 1; return 2; }", &CompileOptions::default());
        assert!(compilation.succeeded());
        assert_eq!(compilation.diagnostics.warnings().count(), 1);
    }

    #[test]
    fn test_diagnostics_are_sorted() {
        let compilation = compile(
            "func f() as int { return x; }\nfunc g() as int { return y; }",
            &CompileOptions::default(),
        );
        let lines: Vec<usize> = compilation
            .diagnostics
            .errors()
            .map(|d| d.position.line)
            .collect();
        assert_eq!(lines, vec![0, 1]);
    }

    #[test]
    fn test_compile_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tidal");
        fs::write(&path, "stage v as int;").unwrap();
        let compilation = compile_file(&path, &CompileOptions::default()).unwrap();
        assert!(compilation.succeeded());
        assert!(matches!(
            compile_file(dir.path().join("missing.tidal"), &CompileOptions::default()),
            Err(CompileError::Io(_))
        ));
    }
}
