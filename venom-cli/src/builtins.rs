//! Built-in worker functions served by `venomq serve`

use serde_json::{json, Value};
use venom_queue::HandlerError;

#[derive(Copy, Clone, PartialEq, Eq, Debug, clap::ValueEnum)]
pub enum Builtin {
    Add,
    Subtract,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Add => "add",
            Builtin::Subtract => "subtract",
        }
    }

    pub fn handler(self) -> fn(&Value) -> Result<Value, HandlerError> {
        match self {
            Builtin::Add => add,
            Builtin::Subtract => subtract,
        }
    }
}

fn operand(args: &Value, name: &str) -> Result<Value, HandlerError> {
    let value = args
        .get(name)
        .ok_or_else(|| HandlerError::MissingArgument(name.to_string()))?;
    if !value.is_number() {
        return Err(HandlerError::InvalidArgument {
            name: name.to_string(),
            reason: format!("expected a number, got {value}"),
        });
    }
    Ok(value.clone())
}

/// Integers stay integers when they fit; everything else goes through f64
fn combine(a: &Value, b: &Value, int_op: fn(i64, i64) -> Option<i64>, float_op: fn(f64, f64) -> f64) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return json!(r);
        }
    }
    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    json!(float_op(x, y))
}

pub fn add(args: &Value) -> Result<Value, HandlerError> {
    let (a, b) = (operand(args, "a")?, operand(args, "b")?);
    Ok(combine(&a, &b, i64::checked_add, |x, y| x + y))
}

pub fn subtract(args: &Value) -> Result<Value, HandlerError> {
    let (a, b) = (operand(args, "a")?, operand(args, "b")?);
    Ok(combine(&a, &b, i64::checked_sub, |x, y| x - y))
}
