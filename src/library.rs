//! The built-in library unit: math, console output and random numbers.
//!
//! The unit is linked into a compile when `UseBuiltinMethods` is set and is
//! consulted only after local resolution fails. It is immutable and may be
//! shared between concurrent compiles.

use indexmap::IndexMap;
use rand::Rng;
use std::sync::{Arc, OnceLock};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{Services, Value};
use crate::types::{NumericKind, TypeData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Print,
    Println,
    Sin,
    Cos,
    Tan,
    Sqrt,
    Arcsin,
    Arccos,
    Arctan,
    Log,
    Log10,
    RandomInt,
    RandomFloat,
}

/// Accepted argument shape of a built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSpec {
    Any,
    Numeric(NumericKind),
}

const ANY: &[ParamSpec] = &[ParamSpec::Any];
const ONE_FLOAT: &[ParamSpec] = &[ParamSpec::Numeric(NumericKind::Float64)];
const TWO_INTS: &[ParamSpec] = &[
    ParamSpec::Numeric(NumericKind::Int32),
    ParamSpec::Numeric(NumericKind::Int32),
];
const TWO_FLOATS: &[ParamSpec] = &[
    ParamSpec::Numeric(NumericKind::Float64),
    ParamSpec::Numeric(NumericKind::Float64),
];

impl Builtin {
    pub const ALL: [Builtin; 13] = [
        Builtin::Print,
        Builtin::Println,
        Builtin::Sin,
        Builtin::Cos,
        Builtin::Tan,
        Builtin::Sqrt,
        Builtin::Arcsin,
        Builtin::Arccos,
        Builtin::Arctan,
        Builtin::Log,
        Builtin::Log10,
        Builtin::RandomInt,
        Builtin::RandomFloat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Println => "println",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Sqrt => "sqrt",
            Builtin::Arcsin => "arcsin",
            Builtin::Arccos => "arccos",
            Builtin::Arctan => "arctan",
            Builtin::Log => "log",
            Builtin::Log10 => "log10",
            Builtin::RandomInt => "randomint",
            Builtin::RandomFloat => "randomfloat",
        }
    }

    pub fn params(&self) -> &'static [ParamSpec] {
        match self {
            Builtin::Print | Builtin::Println => ANY,
            Builtin::RandomInt => TWO_INTS,
            Builtin::RandomFloat => TWO_FLOATS,
            _ => ONE_FLOAT,
        }
    }

    pub fn return_type(&self) -> TypeData {
        match self {
            Builtin::Print | Builtin::Println => TypeData::Nothing,
            Builtin::RandomInt => TypeData::INT32,
            _ => TypeData::FLOAT64,
        }
    }

    /// Calls the built-in. Arguments have already been converted to `params()`.
    pub fn invoke(&self, args: &[Value], services: &Services) -> RuntimeResult<Value> {
        match self {
            Builtin::Print => {
                services.write_output(&args[0].to_string())?;
                Ok(Value::Nothing)
            }
            Builtin::Println => {
                services.write_output(&format!("{}\n", args[0]))?;
                Ok(Value::Nothing)
            }
            Builtin::RandomInt => {
                let min = args[0].as_i64()? as i32;
                let max = args[1].as_i64()? as i32;
                if min >= max {
                    return Ok(Value::Int32(min));
                }
                let value = services.with_rng(|rng| rng.gen_range(min..max));
                Ok(Value::Int32(value))
            }
            Builtin::RandomFloat => {
                let min = args[0].as_f64()?;
                let max = args[1].as_f64()?;
                let unit: f64 = services.with_rng(|rng| rng.gen());
                Ok(Value::Float64(unit * (max - min) + min))
            }
            math => {
                let x = args[0].as_f64()?;
                let y = match math {
                    Builtin::Sin => x.sin(),
                    Builtin::Cos => x.cos(),
                    Builtin::Tan => x.tan(),
                    Builtin::Sqrt => x.sqrt(),
                    Builtin::Arcsin => x.asin(),
                    Builtin::Arccos => x.acos(),
                    Builtin::Arctan => x.atan(),
                    Builtin::Log => x.ln(),
                    Builtin::Log10 => x.log10(),
                    other => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "math function".to_string(),
                            found: other.name().to_string(),
                        })
                    }
                };
                Ok(Value::Float64(y))
            }
        }
    }
}

/// A named, externally linked unit of callable functions.
#[derive(Debug, Clone)]
pub struct Library {
    name: String,
    functions: IndexMap<String, Builtin>,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: IndexMap::new(),
        }
    }

    pub fn with(mut self, builtin: Builtin) -> Self {
        self.functions.insert(builtin.name().to_string(), builtin);
        self
    }

    /// The standard unit, built once per process.
    pub fn standard() -> Arc<Library> {
        static STANDARD: OnceLock<Arc<Library>> = OnceLock::new();
        STANDARD
            .get_or_init(|| {
                Arc::new(
                    Builtin::ALL
                        .iter()
                        .fold(Library::new("std"), |library, builtin| library.with(*builtin)),
                )
            })
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, name: &str) -> Option<Builtin> {
        self.functions.get(name).copied()
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, Builtin)> {
        self.functions.iter().map(|(name, b)| (name.as_str(), *b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_standard_library_contents() {
        let library = Library::standard();
        assert_eq!(library.name(), "std");
        assert_eq!(library.functions().count(), 13);
        assert_eq!(library.lookup("sqrt"), Some(Builtin::Sqrt));
        assert_eq!(library.lookup("randomint"), Some(Builtin::RandomInt));
        assert_eq!(library.lookup("cosh"), None);
    }

    #[test]
    fn test_signatures() {
        assert_eq!(Builtin::Print.return_type(), TypeData::Nothing);
        assert_eq!(Builtin::RandomInt.params().len(), 2);
        assert_eq!(Builtin::Log10.params(), ONE_FLOAT);
        assert_eq!(Builtin::Sin.return_type(), TypeData::FLOAT64);
    }

    #[test]
    fn test_math_invocation() {
        let services = Services::default();
        let result = Builtin::Sqrt.invoke(&[Value::Float64(16.0)], &services).unwrap();
        assert!(matches!(result, Value::Float64(v) if v == 4.0));
        let result = Builtin::Log10.invoke(&[Value::Float64(1000.0)], &services).unwrap();
        let Value::Float64(v) = result else {
            panic!("Expected float result");
        };
        assert_approx_eq!(v, 3.0);
    }

    #[test]
    fn test_random_ranges() {
        let services = Services::default().with_seed(7);
        for _ in 0..100 {
            let value = Builtin::RandomInt
                .invoke(&[Value::Int32(3), Value::Int32(6)], &services)
                .unwrap();
            assert!(matches!(value, Value::Int32(v) if (3..6).contains(&v)));

            let value = Builtin::RandomFloat
                .invoke(&[Value::Float64(-1.0), Value::Float64(1.0)], &services)
                .unwrap();
            assert!(matches!(value, Value::Float64(v) if (-1.0..1.0).contains(&v)));
        }
    }

    #[test]
    fn test_print_goes_to_captured_output() {
        let (services, output) = Services::default().capture_output();
        Builtin::Print.invoke(&[Value::Int32(1)], &services).unwrap();
        Builtin::Println.invoke(&[Value::Float64(2.5)], &services).unwrap();
        assert_eq!(output.contents(), "12.5\n");
    }
}
