//! Value semantics shared by the sandbox interpreter and the policy
//! predicate evaluator. Runtime values are plain JSON values, the same
//! shape tool arguments and responses have on the wire.

use std::cmp::Ordering;

use serde_json::{json, Value};

use super::ast::BinOp;
use crate::error::WardenError;

pub fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Null | Value::Bool(false))
}

pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality that treats `1` and `1.0` as equal.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

/// Ordering for numbers and strings; other pairs are unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `needle in haystack`: array membership, object key, or substring.
pub fn contains(needle: &Value, haystack: &Value, line: usize) -> Result<bool, WardenError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(WardenError::script(
                line,
                format!("object keys are strings, not {}", type_name(other)),
            )),
        },
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(WardenError::script(
                line,
                format!("cannot search a string for {}", type_name(other)),
            )),
        },
        other => Err(WardenError::script(
            line,
            format!("'in' needs an array, object or string, not {}", type_name(other)),
        )),
    }
}

/// Evaluates every binary operator except the short-circuiting `&&`/`||`.
pub fn binary(op: BinOp, lhs: &Value, rhs: &Value, line: usize) -> Result<Value, WardenError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(lhs, rhs))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(lhs, rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(lhs, rhs).ok_or_else(|| {
                WardenError::script(
                    line,
                    format!("cannot compare {} with {}", type_name(lhs), type_name(rhs)),
                )
            })?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinOp::In => Ok(Value::Bool(contains(lhs, rhs, line)?)),
        BinOp::Add => add(lhs, rhs, line),
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arithmetic(op, lhs, rhs, line),
        BinOp::And => Ok(Value::Bool(truthy(lhs) && truthy(rhs))),
        BinOp::Or => Ok(Value::Bool(truthy(lhs) || truthy(rhs))),
    }
}

fn add(lhs: &Value, rhs: &Value, line: usize) -> Result<Value, WardenError> {
    match (lhs, rhs) {
        (Value::String(a), b) => Ok(Value::String(format!("{a}{}", display(b)))),
        (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", display(a)))),
        (Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => arithmetic(BinOp::Add, lhs, rhs, line),
    }
}

fn arithmetic(op: BinOp, lhs: &Value, rhs: &Value, line: usize) -> Result<Value, WardenError> {
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let overflow = || WardenError::script(line, "integer overflow");
        return match op {
            BinOp::Add => a.checked_add(b).map(Value::from).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Value::from).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Value::from).ok_or_else(overflow),
            BinOp::Div | BinOp::Rem if b == 0 => {
                Err(WardenError::script(line, "division by zero"))
            }
            BinOp::Div if a.checked_rem(b) == Some(0) => {
                a.checked_div(b).map(Value::from).ok_or_else(overflow)
            }
            BinOp::Div => Ok(json!(a as f64 / b as f64)),
            _ => a.checked_rem(b).map(Value::from).ok_or_else(overflow),
        };
    }

    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) if lhs.is_number() && rhs.is_number() => {
            if matches!(op, BinOp::Div | BinOp::Rem) && b == 0.0 {
                return Err(WardenError::script(line, "division by zero"));
            }
            let r = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => a % b,
            };
            serde_json::Number::from_f64(r)
                .map(Value::Number)
                .ok_or_else(|| WardenError::script(line, "arithmetic produced a non-finite number"))
        }
        _ => Err(WardenError::script(
            line,
            format!(
                "unsupported operand types for arithmetic: {} and {}",
                type_name(lhs),
                type_name(rhs)
            ),
        )),
    }
}

/// String form used by concatenation and `str()`: strings unquoted,
/// everything else as compact JSON.
pub fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `target.field`. Missing keys read as `null`; field access on
/// anything but an object is an error.
pub fn field(target: &Value, name: &str, line: usize) -> Result<Value, WardenError> {
    match target {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        other => Err(WardenError::script(
            line,
            format!("cannot read field '{name}' of {}", type_name(other)),
        )),
    }
}

/// `target[index]`; negative array indices count from the end.
pub fn index(target: &Value, idx: &Value, line: usize) -> Result<Value, WardenError> {
    match (target, idx) {
        (Value::Array(items), Value::Number(_)) => {
            let i = idx
                .as_i64()
                .ok_or_else(|| WardenError::script(line, "array index must be an integer"))?;
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            Ok(if (0..len).contains(&i) {
                items[i as usize].clone()
            } else {
                Value::Null
            })
        }
        (Value::Object(_), Value::String(key)) => field(target, key, line),
        (t, i) => Err(WardenError::script(
            line,
            format!("cannot index {} with {}", type_name(t), type_name(i)),
        )),
    }
}

/// Rough heap footprint of a value in bytes, used for the sandbox
/// memory ceiling. Overestimates small values on purpose.
pub fn approx_size(v: &Value) -> usize {
    match v {
        Value::Null | Value::Bool(_) | Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(approx_size).sum::<usize>(),
        Value::Object(map) => {
            48 + map
                .iter()
                .map(|(k, v)| 24 + k.len() + approx_size(v))
                .sum::<usize>()
        }
    }
}

/// Nesting depth of a value: 1 for scalars, one more per enclosing
/// array or object. Walks with an explicit stack.
pub fn nesting_depth(v: &Value) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(v, 1)];
    while let Some((v, depth)) = pending.pop() {
        deepest = deepest.max(depth);
        match v {
            Value::Array(items) => pending.extend(items.iter().map(|item| (item, depth + 1))),
            Value::Object(map) => pending.extend(map.values().map(|item| (item, depth + 1))),
            _ => {}
        }
    }
    deepest
}

/// Follows a dotted path (`address.city`) through nested objects.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |v, segment| v.get(segment))
}

/// Removes the value at a dotted path. Arrays along the way are
/// traversed element-wise, so `items.secret` redacts `secret` from
/// every element of `items`. Returns how many values were removed.
pub fn remove_path(root: &mut Value, path: &str) -> usize {
    match root {
        Value::Array(items) => items.iter_mut().map(|item| remove_path(item, path)).sum(),
        Value::Object(map) => match path.split_once('.') {
            None => usize::from(map.remove(path).is_some()),
            Some((head, rest)) => map.get_mut(head).map_or(0, |child| remove_path(child, rest)),
        },
        _ => 0,
    }
}
