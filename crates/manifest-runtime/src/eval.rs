//! Constraint-expression evaluation over JSON state and payload.
//!
//! `self.x` reads the aggregate snapshot; bare identifiers resolve
//! against the payload first, then the snapshot. Type-mismatched
//! operations evaluate to null rather than failing; a constraint whose
//! expression is anything but boolean `true` counts as violated.

use manifest_lang::ast::{BinaryOp, Expr, UnaryOp};
use serde_json::Value;

/// Evaluation context for one command invocation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub state: &'a Value,
    pub payload: &'a Value,
}

pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Value {
    match expr {
        Expr::Literal { value } => value.to_json(),
        Expr::Ident { name } => match name.as_str() {
            "self" => ctx.state.clone(),
            "payload" => ctx.payload.clone(),
            other => lookup(ctx, other),
        },
        Expr::Member { object, property } => {
            let object = evaluate(object, ctx);
            object.get(property).cloned().unwrap_or(Value::Null)
        }
        Expr::Unary { op, operand } => {
            let operand = evaluate(operand, ctx);
            match op {
                UnaryOp::Not => Value::Bool(!truthy(&operand)),
                UnaryOp::Neg => as_number(&operand)
                    .map(|n| number(-n))
                    .unwrap_or(Value::Null),
            }
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, ctx);
            let right = evaluate(right, ctx);
            binary(*op, &left, &right)
        }
    }
}

fn lookup(ctx: &EvalContext<'_>, name: &str) -> Value {
    if let Some(value) = ctx.payload.get(name) {
        return value.clone();
    }
    ctx.state.get(name).cloned().unwrap_or(Value::Null)
}

/// Truthiness mirrors the payload/state JSON model: null and empty
/// strings/arrays are false, everything else is what you'd expect.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::String(l), r) => Value::String(format!("{l}{}", stringify(r))),
            (l, Value::String(r)) => Value::String(format!("{}{r}", stringify(l))),
            _ => arithmetic(left, right, |l, r| l + r),
        },
        BinaryOp::Sub => arithmetic(left, right, |l, r| l - r),
        BinaryOp::Mul => arithmetic(left, right, |l, r| l * r),
        BinaryOp::Div => match (as_number(left), as_number(right)) {
            (Some(_), Some(r)) if r == 0.0 => Value::Null,
            (Some(l), Some(r)) => number(l / r),
            _ => Value::Null,
        },
        BinaryOp::Mod => match (as_number(left), as_number(right)) {
            (Some(_), Some(r)) if r == 0.0 => Value::Null,
            (Some(l), Some(r)) => number(l % r),
            _ => Value::Null,
        },
        BinaryOp::Eq => Value::Bool(loose_eq(left, right)),
        BinaryOp::Ne => Value::Bool(!loose_eq(left, right)),
        BinaryOp::Lt => comparison(left, right, |o| o == std::cmp::Ordering::Less),
        BinaryOp::Gt => comparison(left, right, |o| o == std::cmp::Ordering::Greater),
        BinaryOp::Le => comparison(left, right, |o| o != std::cmp::Ordering::Greater),
        BinaryOp::Ge => comparison(left, right, |o| o != std::cmp::Ordering::Less),
        BinaryOp::And => Value::Bool(truthy(left) && truthy(right)),
        BinaryOp::Or => Value::Bool(truthy(left) || truthy(right)),
        BinaryOp::In => membership(right, left),
        BinaryOp::Contains => membership(left, right),
    }
}

fn arithmetic(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> Value {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => number(op(l, r)),
        _ => Value::Null,
    }
}

fn comparison(left: &Value, right: &Value, accept: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    let ordering = match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => None,
        },
    };
    ordering.map(|o| Value::Bool(accept(o))).unwrap_or(Value::Null)
}

/// `needle in haystack` / `haystack contains needle` over arrays and
/// strings.
fn membership(haystack: &Value, needle: &Value) -> Value {
    match haystack {
        Value::Array(items) => Value::Bool(items.iter().any(|item| loose_eq(item, needle))),
        Value::String(s) => Value::Bool(s.contains(&stringify(needle))),
        _ => Value::Bool(false),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
