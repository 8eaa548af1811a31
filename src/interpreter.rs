//! Evaluates single expressions in the context of a program.

use std::sync::Arc;
use tracing::debug;

use crate::compiler::{compile, compile_program};
use crate::error::CompileResult;
use crate::options::CompileOptions;
use crate::runtime::Value;
use crate::simulator::Simulation;

const EVALUATE_NAME: &str = "__evaluate";

pub struct Interpreter {
    source: String,
    options: CompileOptions,
    seed: Option<u64>,
}

impl Interpreter {
    /// Checks that `source` compiles on its own.
    pub fn new(source: impl Into<String>, options: CompileOptions) -> CompileResult<Self> {
        let source = source.into();
        compile(&source, &options).into_result()?;
        Ok(Self {
            source,
            options,
            seed: None,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Evaluates `EXPR;` as the body of a synthetic function appended to the
    /// program. Stages and parameters are visible but uninitialized.
    pub fn evaluate(&self, expression: &str) -> CompileResult<Value> {
        let expression = expression.trim().trim_end_matches(';');
        let source = format!("{}\nfunc {}() = {};\n", self.source, EVALUATE_NAME, expression);
        debug!(expression, "evaluating");

        let program = compile_program(&source, &self.options)?;
        let mut simulation = Simulation::new(Arc::new(program));
        if let Some(seed) = self.seed {
            simulation = simulation.with_seed(seed);
        }
        Ok(simulation.call(EVALUATE_NAME, Vec::new())?)
    }
}
