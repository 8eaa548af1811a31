use assert_approx_eq::assert_approx_eq;
use tidal::error::{CompileError, RuntimeError};
use tidal::{CompileOptions, Interpreter, Value};

fn interpreter() -> Interpreter {
    match Interpreter::new("", CompileOptions::default()) {
        Ok(interpreter) => interpreter,
        Err(e) => panic!("Expected an empty program to compile: {}", e),
    }
}

fn evaluate(expression: &str) -> Value {
    interpreter().evaluate(expression).unwrap()
}

#[test]
fn test_numeric_promotion() {
    assert_eq!(evaluate("1 + 2;"), Value::Int32(3));
    assert_eq!(evaluate("1 + 2.5;"), Value::Float64(3.5));
    assert_eq!(evaluate("3000000000 + 1;"), Value::Int64(3000000001));
    assert_eq!(evaluate("4 / 2;"), Value::Float64(2.0));
}

#[test]
fn test_integer_division_and_modulo() {
    assert_eq!(evaluate("17 idiv 5;"), Value::Int32(3));
    assert_eq!(evaluate("17 mod 5;"), Value::Int32(2));
    assert!(matches!(
        interpreter().evaluate("1 mod 0;"),
        Err(CompileError::Runtime(RuntimeError::DivisionByZero))
    ));
}

#[test]
fn test_small_kinds_wrap() {
    assert_eq!(evaluate("(100 as sbyte) + (100 as sbyte);"), Value::SByte(-56));
    assert_eq!(evaluate("(200 as ubyte) + (100 as ubyte);"), Value::UByte(44));
    assert_eq!(evaluate("2147483647 + 1;"), Value::Int32(i32::MIN));
}

#[test]
fn test_boolean_precedence() {
    assert_eq!(evaluate("not true and false = false;"), Value::Bool(false));
    assert_eq!(evaluate("not (true and false) = true;"), Value::Bool(true));
    assert_eq!(evaluate("true or false and false;"), Value::Bool(true));
    assert_eq!(evaluate("1 < 2 and 3 >= 3;"), Value::Bool(true));
}

#[test]
fn test_conditional() {
    assert_eq!(evaluate("1 < 2 ? 10 : 20;"), Value::Int32(10));
    assert_eq!(evaluate("1 > 2 ? 10 : 20;"), Value::Int32(20));
}

#[test]
fn test_builtins() {
    let Value::Float64(root) = evaluate("sqrt(16);") else {
        panic!("Expected a float");
    };
    assert_approx_eq!(root, 4.0);
    let Value::Float64(sine) = evaluate("sin(0);") else {
        panic!("Expected a float");
    };
    assert_approx_eq!(sine, 0.0);
}

#[test]
fn test_seeded_random_is_deterministic() {
    let first = interpreter().with_seed(7).evaluate("randomint(0, 1000);").unwrap();
    let second = interpreter().with_seed(7).evaluate("randomint(0, 1000);").unwrap();
    assert_eq!(first, second);
    let Value::Int32(roll) = first else {
        panic!("Expected an int");
    };
    assert!((0..1000).contains(&roll));
}

#[test]
fn test_program_context() {
    let interpreter = match Interpreter::new(
        "param k = 3; struct P = (x, y); func scale(v) = v * k;",
        CompileOptions::default(),
    ) {
        Ok(interpreter) => interpreter,
        Err(e) => panic!("Expected the program to compile: {}", e),
    };
    assert_eq!(interpreter.evaluate("scale(2);").unwrap(), Value::Float64(6.0));
    assert_eq!(interpreter.evaluate("P(1, 2).y;").unwrap(), Value::Float64(2.0));
    assert!(matches!(
        interpreter.evaluate("scale(1, 2);"),
        Err(CompileError::Diagnostics(_))
    ));
}
