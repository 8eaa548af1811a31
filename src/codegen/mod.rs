//! Lowering of a checked program unit into an executable [`ir::Program`].
//!
//! Runs only after the error gate, so every expression and type it meets is
//! valid. Each stage is rewritten through its hold-state policy, implicit
//! numeric conversions become explicit, and the host entry points
//! `initialize` and `run` are assembled around the user's `init` and
//! `operation` blocks.

mod expressions;
pub mod ir;
pub mod printer;
mod statements;

use std::collections::HashMap;
use std::mem;
use tracing::{debug, info};

use crate::ast::{Body, ProgramUnit};
use crate::options::CompileOptions;
use crate::symbol_table::{Symbol, SymbolId, SymbolKind, SymbolTable};
use crate::types::TypeData;

pub use expressions::fold_constants;
use ir::{
    LExpr, LStmt, LType, LocalId, LocalInfo, ParamId, ParameterLayout, ParameterSource, Program, Routine,
    StageId, StageLayout, StructLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterMode {
    External,
    Cached,
    Computed,
}

/// Per-routine lowering state.
#[derive(Debug, Default)]
struct RoutineState {
    locals: Vec<LocalInfo>,
    local_ids: HashMap<SymbolId, LocalId>,
    return_type: Option<TypeData>,
    parallel_depth: usize,
}

pub struct Lowerer<'a> {
    table: &'a SymbolTable,
    options: &'a CompileOptions,
    stages: HashMap<SymbolId, StageId>,
    stage_layouts: Vec<StageLayout>,
    parameters: HashMap<SymbolId, (ParamId, ParameterMode)>,
    functions: HashMap<SymbolId, usize>,
    routine: RoutineState,
    /// Source of synthetic local names; owned by this compile.
    temp_counter: usize,
}

/// Lowers `unit`. The unit must have passed type checking without errors.
pub fn lower(unit: &ProgramUnit, options: &CompileOptions) -> Program {
    Lowerer::new(&unit.table, options).lower(unit)
}

impl<'a> Lowerer<'a> {
    pub fn new(table: &'a SymbolTable, options: &'a CompileOptions) -> Self {
        Self {
            table,
            options,
            stages: HashMap::new(),
            stage_layouts: Vec::new(),
            parameters: HashMap::new(),
            functions: HashMap::new(),
            routine: RoutineState::default(),
            temp_counter: 0,
        }
    }

    pub fn lower(mut self, unit: &ProgramUnit) -> Program {
        let stage_symbols = unit.stages();
        let parameter_symbols = unit.parameters();
        let function_symbols = unit.functions();

        for (id, symbol) in stage_symbols.iter().enumerate() {
            self.stages.insert(*symbol, id);
        }
        for (id, symbol) in parameter_symbols.iter().enumerate() {
            let mode = self.parameter_mode(self.table.symbol(*symbol));
            self.parameters.insert(*symbol, (id, mode));
        }
        for (id, symbol) in function_symbols.iter().enumerate() {
            self.functions.insert(*symbol, id);
        }

        self.stage_layouts = stage_symbols
            .iter()
            .map(|symbol| self.lower_stage(*symbol))
            .collect();

        let parameters = parameter_symbols
            .iter()
            .map(|symbol| self.lower_parameter(*symbol))
            .collect();

        let functions = function_symbols
            .iter()
            .map(|symbol| self.lower_function(*symbol))
            .collect();

        let structs = unit
            .structs()
            .into_iter()
            .map(|symbol| self.lower_struct(symbol))
            .collect();

        let initialize = self.lower_initialize(unit);
        let run = self.lower_run(unit);

        let program = Program {
            name: self.options.program_name(),
            stages: mem::take(&mut self.stage_layouts),
            parameters,
            functions,
            structs,
            initialize,
            run,
            parallel_allocation: self
                .options
                .parallelization_option
                .parallel_array_initialization(),
        };

        info!(
            program = %program.name,
            stages = program.stages.len(),
            parameters = program.parameters.len(),
            functions = program.functions.len(),
            "lowered program"
        );
        program
    }

    fn parameter_mode(&self, symbol: &Symbol) -> ParameterMode {
        match &symbol.kind {
            SymbolKind::Parameter { body: None } => ParameterMode::External,
            SymbolKind::Parameter {
                body: Some(Body::Expression(expression)),
            } if self.options.cache_parameters && expression.is_constant(self.table) => {
                ParameterMode::Cached
            }
            _ => ParameterMode::Computed,
        }
    }

    fn symbol_type(&self, symbol: SymbolId) -> TypeData {
        self.table.symbol(symbol).ty.clone().unwrap_or(TypeData::Invalid)
    }

    pub(crate) fn lower_type(&mut self, ty: &TypeData) -> LType {
        let table = self.table;
        match ty {
            TypeData::Nothing => LType::Nothing,
            TypeData::Numeric(kind) => LType::Numeric(*kind),
            TypeData::Array(array) => LType::Array {
                element: Box::new(self.lower_type(&array.element)),
                size: array
                    .size
                    .as_ref()
                    .map(|size| Box::new(self.lower_expression(size))),
            },
            TypeData::Struct(structure) => LType::Struct {
                name: structure.name.clone(),
                fields: structure
                    .fields(table)
                    .iter()
                    .map(|field| {
                        let ty = self.symbol_type(*field);
                        self.lower_type(&ty)
                    })
                    .collect(),
            },
            TypeData::Invalid => unreachable!("invalid type reached lowering"),
        }
    }

    fn lower_stage(&mut self, symbol: SymbolId) -> StageLayout {
        let table = self.table;
        let stage = table.symbol(symbol);
        let Some(hold) = stage.hold_state() else {
            unreachable!("'{}' is not a stage", stage.name);
        };
        let ty = self.symbol_type(symbol);
        debug!(stage = %stage.name, hold = %hold, ty = %ty, "stage layout");

        self.routine = RoutineState::default();
        StageLayout {
            name: stage.name.clone(),
            allocates: ty.is_object_new_needed(),
            reusable: ty.is_object_reusable(table),
            ty: self.lower_type(&ty),
            hold,
        }
    }

    fn lower_parameter(&mut self, symbol: SymbolId) -> ParameterLayout {
        let table = self.table;
        let parameter = table.symbol(symbol);
        let ty = self.symbol_type(symbol);
        let (_, mode) = self.parameters[&symbol];

        let source = match (&parameter.kind, mode) {
            (_, ParameterMode::External) => ParameterSource::External,
            (SymbolKind::Parameter { body: Some(body) }, mode) => {
                let routine = self.lower_routine(&parameter.name, &[], &ty, body);
                if mode == ParameterMode::Cached {
                    ParameterSource::Cached(routine)
                } else {
                    ParameterSource::Computed(routine)
                }
            }
            _ => unreachable!("'{}' is not a parameter", parameter.name),
        };

        self.routine = RoutineState::default();
        ParameterLayout {
            name: parameter.name.clone(),
            ty: self.lower_type(&ty),
            source,
        }
    }

    fn lower_function(&mut self, symbol: SymbolId) -> Routine {
        let table = self.table;
        let function = table.symbol(symbol);
        let SymbolKind::Function {
            params,
            body: Some(body),
            ..
        } = &function.kind
        else {
            unreachable!("function '{}' has no body after the error gate", function.name);
        };
        let ty = self.symbol_type(symbol);
        self.lower_routine(&function.name, params, &ty, body)
    }

    fn lower_struct(&mut self, symbol: SymbolId) -> StructLayout {
        self.routine = RoutineState::default();
        let table = self.table;
        let fields = table
            .struct_fields(symbol)
            .iter()
            .map(|field| {
                let ty = self.symbol_type(*field);
                (table.symbol(*field).name.clone(), self.lower_type(&ty))
            })
            .collect();
        StructLayout {
            name: table.symbol(symbol).name.clone(),
            fields,
        }
    }

    fn lower_routine(&mut self, name: &str, params: &[SymbolId], returns: &TypeData, body: &Body) -> Routine {
        self.routine = RoutineState {
            return_type: Some(returns.clone()),
            ..RoutineState::default()
        };
        for param in params {
            self.declare_local(*param);
        }

        let body = match body {
            Body::Expression(expression) => {
                vec![LStmt::Return(Some(self.lower_as(expression, returns)))]
            }
            Body::Block(block) => self.lower_block(block),
        };
        let returns = self.lower_type(returns);

        Routine {
            name: name.to_string(),
            params: params.len(),
            locals: mem::take(&mut self.routine.locals),
            returns,
            body,
        }
    }

    fn host_routine(&mut self, name: &str, body: Vec<LStmt>) -> Routine {
        Routine {
            name: name.to_string(),
            params: 0,
            locals: mem::take(&mut self.routine.locals),
            returns: LType::Nothing,
            body,
        }
    }

    fn cache_parameters(&self) -> Vec<LStmt> {
        let mut cached: Vec<ParamId> = self
            .parameters
            .values()
            .filter(|(_, mode)| *mode == ParameterMode::Cached)
            .map(|(id, _)| *id)
            .collect();
        cached.sort_unstable();
        cached.into_iter().map(LStmt::CacheParameter).collect()
    }

    /// Array stages whose slot indices are computed once per tick.
    fn cached_stages(&self) -> Vec<StageId> {
        if !self.options.cache_stages {
            return Vec::new();
        }
        self.allocating_stages()
    }

    fn allocating_stages(&self) -> Vec<StageId> {
        self.stage_layouts
            .iter()
            .enumerate()
            .filter(|(_, layout)| layout.allocates)
            .map(|(id, _)| id)
            .collect()
    }

    pub(crate) fn is_stage_cached(&self, stage: StageId) -> bool {
        self.options.cache_stages && self.stage_layouts[stage].allocates
    }

    fn next_slot(&self, stage: StageId) -> LExpr {
        self.stage_layouts[stage]
            .hold
            .index_expr(expressions::next_time())
    }

    /// Allocates all histories, materializes the elements of tick 0 and
    /// runs `init` with `now` bound to -1.
    fn lower_initialize(&mut self, unit: &ProgramUnit) -> Routine {
        self.routine = RoutineState {
            return_type: Some(TypeData::Nothing),
            ..RoutineState::default()
        };

        let mut body = vec![LStmt::SetNow(LExpr::int32(-1))];
        body.extend(self.cache_parameters());
        body.extend((0..self.stage_layouts.len()).map(LStmt::AllocateStage));
        for stage in self.allocating_stages() {
            body.push(LStmt::Allocate {
                stage,
                slot: self.next_slot(stage),
                guard: None,
            });
        }
        body.extend(self.cached_stages().into_iter().map(LStmt::CacheStage));

        let table = self.table;
        if let Some(SymbolKind::Initialization { body: Some(block) }) =
            unit.initialization().map(move |id| &table.symbol(id).kind)
        {
            body.extend(self.lower_block(block));
        }

        self.host_routine("initialize", body)
    }

    /// One tick: notify, materialize the `next` elements, refresh the slot
    /// caches, then run `operation`.
    fn lower_run(&mut self, unit: &ProgramUnit) -> Routine {
        self.routine = RoutineState {
            return_type: Some(TypeData::Nothing),
            ..RoutineState::default()
        };

        let mut tick = vec![LStmt::NotifyTimeChanged];
        for stage in self.allocating_stages() {
            let layout = &self.stage_layouts[stage];
            tick.push(LStmt::Allocate {
                stage,
                slot: self.next_slot(stage),
                guard: layout.hold.move_next_guard(layout.reusable),
            });
        }
        tick.extend(self.cached_stages().into_iter().map(LStmt::CacheStage));

        let table = self.table;
        if let Some(SymbolKind::Operation { body: Some(block) }) =
            unit.operation().map(move |id| &table.symbol(id).kind)
        {
            tick.extend(self.lower_block(block));
        }

        let mut body = self.cache_parameters();
        body.push(LStmt::ForEachTick(tick));
        self.host_routine("run", body)
    }

    fn declare_local(&mut self, symbol: SymbolId) -> LocalId {
        let local = self.routine.locals.len();
        let ty = self.symbol_type(symbol);
        let name = self
            .table
            .symbol(symbol)
            .display_name(self.options.add_unique_no_to_variable);
        let ty = self.lower_type(&ty);
        self.routine.locals.push(LocalInfo { name, ty });
        self.routine.local_ids.insert(symbol, local);
        local
    }

    fn temp_local(&mut self, ty: LType) -> LocalId {
        let local = self.routine.locals.len();
        let name = format!("__t{}", self.temp_counter);
        self.temp_counter += 1;
        self.routine.locals.push(LocalInfo { name, ty });
        local
    }

    fn local_id(&self, symbol: SymbolId) -> LocalId {
        match self.routine.local_ids.get(&symbol) {
            Some(local) => *local,
            None => unreachable!(
                "local '{}' used outside its routine",
                self.table.symbol(symbol).name
            ),
        }
    }
}
