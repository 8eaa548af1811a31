pub mod ast;
pub mod codegen;
pub mod compiler;
pub mod error;
pub mod hold_state;
pub mod interpreter;
pub mod lexer;
pub mod library;
pub mod options;
pub mod parser;
pub mod runtime;
pub mod simulator;
pub mod symbol_table;
pub mod type_checker;
pub mod types;

pub use compiler::{compile, compile_program, Compilation};
pub use interpreter::Interpreter;
pub use options::CompileOptions;
pub use runtime::Value;
pub use simulator::Simulation;
