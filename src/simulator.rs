//! The host side of a lowered program.
//!
//! A [`Simulation`] owns the program state and drives the two entry points:
//! `initialize` exactly once, then `run`. Between the two the host may seed
//! external parameters and the initial value of any stage. Observers
//! registered with [`Simulation::on_time_changed`] are called at the start
//! of every tick.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument};

use crate::codegen::ir::{LType, ParameterSource, Program, StageId};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{DirectMemory, Executor, Globals, Services, Step, TimeObserver, Value};

pub struct Simulation {
    program: Arc<Program>,
    services: Services,
    observers: Mutex<Vec<TimeObserver>>,
    globals: Globals,
    initialized: bool,
}

fn conform(value: Value, ty: &LType) -> RuntimeResult<Value> {
    match ty.as_numeric() {
        Some(kind) => value.convert(kind),
        None => Ok(value),
    }
}

impl Simulation {
    pub fn new(program: Arc<Program>) -> Self {
        let globals = Globals::new(&program);
        Self {
            program,
            services: Services::default(),
            observers: Mutex::new(Vec::new()),
            globals,
            initialized: false,
        }
    }

    /// Sends `print`/`println` output to `writer` instead of stdout.
    pub fn with_output(mut self, writer: impl Write + Send + 'static) -> Self {
        self.services = self.services.with_output(writer);
        self
    }

    /// Makes the random built-ins deterministic.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.services = self.services.with_seed(seed);
        self
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn now(&self) -> i64 {
        self.globals.now
    }

    pub fn max_time(&self) -> i64 {
        self.globals.max_time
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn on_time_changed(&mut self, observer: impl FnMut(i64) + Send + 'static) {
        self.observers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(observer));
    }

    /// Sets an external parameter; the value is converted to the declared type.
    pub fn set_parameter(&mut self, name: &str, value: Value) -> RuntimeResult<()> {
        let id = self
            .program
            .parameter_id(name)
            .ok_or_else(|| RuntimeError::UnknownParameter(name.to_string()))?;
        let layout = &self.program.parameters[id];
        if !matches!(layout.source, ParameterSource::External) {
            return Err(RuntimeError::NotAssignable(name.to_string()));
        }
        self.globals.parameters[id] = conform(value, &layout.ty)?;
        Ok(())
    }

    #[instrument(skip(self), fields(program = %self.program.name))]
    pub fn initialize(&mut self, max_time: usize) -> RuntimeResult<()> {
        if self.initialized {
            return Err(RuntimeError::AlreadyInitialized);
        }
        let program = Arc::clone(&self.program);
        let executor = Executor::new(&program, &self.services);

        for (id, layout) in program.parameters.iter().enumerate() {
            if matches!(layout.source, ParameterSource::External)
                && self.globals.parameters[id] == Value::Nothing
            {
                debug!(parameter = %layout.name, "external parameter defaults to zero");
                let value = executor.default_value(&layout.ty, &mut DirectMemory::new(&mut self.globals))?;
                self.globals.parameters[id] = value;
            }
        }

        self.globals.max_time = max_time as i64;
        executor.call_routine(&program.initialize, Vec::new(), &mut DirectMemory::new(&mut self.globals))?;
        self.initialized = true;
        info!(max_time, stages = program.stages.len(), "initialized");
        Ok(())
    }

    /// Overwrites the value of a stage at time 0. Only valid between
    /// `initialize` and `run`.
    pub fn set_stage_initial(&mut self, name: &str, value: Value) -> RuntimeResult<()> {
        if !self.initialized {
            return Err(RuntimeError::NotInitialized);
        }
        let id = self.stage_id(name)?;
        let layout = &self.program.stages[id];
        let value = conform(value, &layout.ty)?;
        let slot = layout.hold.slot(0);
        *self.globals.stages[id].at_mut(&[Step::Index(slot)])? = value;
        Ok(())
    }

    /// Runs ticks `0..max_time`.
    #[instrument(skip(self), fields(program = %self.program.name))]
    pub fn run(&mut self, max_time: usize) -> RuntimeResult<()> {
        if !self.initialized {
            return Err(RuntimeError::NotInitialized);
        }
        let program = Arc::clone(&self.program);
        let executor = Executor::new(&program, &self.services).with_observers(&self.observers);
        self.globals.max_time = max_time as i64;
        let mut memory = DirectMemory::new(&mut self.globals);
        executor.call_routine(&program.run, Vec::new(), &mut memory)?;
        info!(max_time, now = self.globals.now, "run finished");
        Ok(())
    }

    /// Initializes, applies the given initial stage values and runs.
    pub fn simulate(&mut self, max_time: usize, initial: &[(&str, Value)]) -> RuntimeResult<()> {
        self.initialize(max_time)?;
        for (name, value) in initial {
            self.set_stage_initial(name, value.clone())?;
        }
        self.run(max_time)
    }

    fn stage_id(&self, name: &str) -> RuntimeResult<StageId> {
        self.program
            .stage_id(name)
            .ok_or_else(|| RuntimeError::UnknownStage(name.to_string()))
    }

    /// The whole retained history of a stage.
    pub fn stage(&self, name: &str) -> RuntimeResult<&Value> {
        let id = self.stage_id(name)?;
        Ok(&self.globals.stages[id])
    }

    /// The value of a stage at `time`, addressed through its hold state.
    pub fn stage_at(&self, name: &str, time: i64) -> RuntimeResult<&Value> {
        let id = self.stage_id(name)?;
        let slot = self.program.stages[id].hold.slot(time);
        self.globals.stages[id].at(&[Step::Index(slot)])
    }

    /// Current value of a parameter. Computed parameters are evaluated at
    /// the current `now`.
    pub fn parameter(&mut self, name: &str) -> RuntimeResult<Value> {
        let id = self
            .program
            .parameter_id(name)
            .ok_or_else(|| RuntimeError::UnknownParameter(name.to_string()))?;
        let program = Arc::clone(&self.program);
        match program.parameters[id].routine() {
            None => Ok(self.globals.parameters[id].clone()),
            Some(routine) => {
                let executor = Executor::new(&program, &self.services);
                executor.call_routine(routine, Vec::new(), &mut DirectMemory::new(&mut self.globals))
            }
        }
    }

    /// Calls a function of the program with the current state.
    pub fn call(&mut self, name: &str, arguments: Vec<Value>) -> RuntimeResult<Value> {
        let program = Arc::clone(&self.program);
        let id = program
            .function_id(name)
            .ok_or_else(|| RuntimeError::UnknownFunction(name.to_string()))?;
        let routine = &program.functions[id];
        if arguments.len() != routine.params {
            return Err(RuntimeError::TypeMismatch {
                expected: format!("{} argument(s)", routine.params),
                found: format!("{} argument(s)", arguments.len()),
            });
        }
        let arguments = arguments
            .into_iter()
            .zip(&routine.locals)
            .map(|(argument, local)| conform(argument, &local.ty))
            .collect::<RuntimeResult<Vec<_>>>()?;

        let executor = Executor::new(&program, &self.services);
        executor.call_routine(routine, arguments, &mut DirectMemory::new(&mut self.globals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_program;
    use crate::options::CompileOptions;

    fn simulation(source: &str) -> Simulation {
        let program = compile_program(source, &CompileOptions::default()).expect("program compiles");
        Simulation::new(Arc::new(program))
    }

    #[test]
    fn test_initialize_exactly_once() {
        let mut sim = simulation("stage v as int;");
        assert!(matches!(sim.run(3), Err(RuntimeError::NotInitialized)));
        assert!(matches!(sim.set_stage_initial("v", Value::Int32(1)), Err(RuntimeError::NotInitialized)));
        sim.initialize(3).unwrap();
        assert!(matches!(sim.initialize(3), Err(RuntimeError::AlreadyInitialized)));
    }

    #[test]
    fn test_external_parameters() {
        let mut sim = simulation("param rate; param derived = rate * 2;");
        sim.set_parameter("rate", Value::Int32(3)).unwrap();
        assert_eq!(sim.parameter("rate").unwrap(), Value::Float64(3.0));
        assert!(matches!(
            sim.set_parameter("derived", Value::Float64(1.0)),
            Err(RuntimeError::NotAssignable(_))
        ));
        assert!(matches!(
            sim.set_parameter("missing", Value::Float64(1.0)),
            Err(RuntimeError::UnknownParameter(_))
        ));
        sim.initialize(1).unwrap();
        assert_eq!(sim.parameter("derived").unwrap(), Value::Float64(6.0));
    }

    #[test]
    fn test_unset_external_defaults_to_zero() {
        let mut sim = simulation("param n as int;");
        sim.initialize(1).unwrap();
        assert_eq!(sim.parameter("n").unwrap(), Value::Int32(0));
    }

    #[test]
    fn test_time_changed_observer() {
        let mut sim = simulation("stage v as int; operation { v <= v + 1; }");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sim.on_time_changed(move |now| sink.lock().unwrap().push(now));
        sim.simulate(4, &[]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(sim.stage_at("v", 4).unwrap(), &Value::Int32(4));
    }

    #[test]
    fn test_initial_stage_value() {
        let mut sim = simulation("stage v as float; operation { v <= v * 2; }");
        sim.simulate(3, &[("v", Value::Int32(1))]).unwrap();
        assert_eq!(sim.stage_at("v", 0).unwrap(), &Value::Float64(1.0));
        assert_eq!(sim.stage_at("v", 3).unwrap(), &Value::Float64(8.0));
        assert!(matches!(sim.stage_at("w", 0), Err(RuntimeError::UnknownStage(_))));
    }

    #[test]
    fn test_call_converts_arguments() {
        let mut sim = simulation("func half(x as float) as float = x / 2;");
        assert_eq!(sim.call("half", vec![Value::Int32(3)]).unwrap(), Value::Float64(1.5));
        assert!(matches!(sim.call("half", Vec::new()), Err(RuntimeError::TypeMismatch { .. })));
        assert!(matches!(sim.call("other", Vec::new()), Err(RuntimeError::UnknownFunction(_))));
    }
}
