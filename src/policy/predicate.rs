//! `scope_restriction` predicates.
//!
//! A predicate is a single warden-script expression. Bare identifiers
//! name argument fields, `$name` references the policy context
//! (`$principal` plus any attribute). Tool calls are not allowed.
//! A comparison against a missing field is false, so a predicate such as
//! `limit <= 50` rejects calls that omit `limit`; use `has(limit)` to
//! test presence explicitly.

use serde_json::{Map, Value};

use super::PolicyContext;
use crate::error::WardenError;
use crate::script::ast::{BinOp, Expr, UnaryOp};
use crate::script::parse_predicate;
use crate::script::value;

#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
    fields: Vec<String>,
}

impl Predicate {
    /// Parses and checks a predicate. Anything that would not be a pure
    /// expression over the arguments is rejected as `MalformedPolicy`.
    pub fn compile(source: &str) -> Result<Self, WardenError> {
        let expr = parse_predicate(source).map_err(|e| {
            WardenError::malformed(format!("predicate '{source}': {e}"))
        })?;
        let mut fields = Vec::new();
        check_pure(&expr, source, &mut fields)?;
        Ok(Self {
            source: source.to_string(),
            expr,
            fields,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Argument fields the predicate refers to, in order of appearance.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Evaluates against an arguments object. `Err` carries a reason for
    /// a predicate that could not be evaluated (which callers treat as a
    /// failure, never as a pass).
    pub fn evaluate(&self, args: &Value, ctx: &PolicyContext) -> Result<bool, String> {
        let eval = Evaluator { args, ctx };
        eval.eval(&self.expr).map(|v| value::truthy(&v))
    }
}

fn check_pure(expr: &Expr, source: &str, fields: &mut Vec<String>) -> Result<(), WardenError> {
    let reject = |what: &str| {
        Err(WardenError::malformed(format!(
            "predicate '{source}' may not contain {what}"
        )))
    };
    match expr {
        Expr::Literal(_) | Expr::Context { .. } => Ok(()),
        Expr::Var { name, .. } => {
            if !fields.contains(name) {
                fields.push(name.clone());
            }
            Ok(())
        }
        Expr::Array(items) => items.iter().try_for_each(|e| check_pure(e, source, fields)),
        Expr::Object(entries) => entries
            .iter()
            .try_for_each(|(_, e)| check_pure(e, source, fields)),
        Expr::Field { target, .. } => check_pure(target, source, fields),
        Expr::Index { target, index, .. } => {
            check_pure(target, source, fields)?;
            check_pure(index, source, fields)
        }
        Expr::Unary { operand, .. } => check_pure(operand, source, fields),
        Expr::Binary { lhs, rhs, .. } => {
            check_pure(lhs, source, fields)?;
            check_pure(rhs, source, fields)
        }
        Expr::Builtin { name, args, .. } => {
            if matches!(name.as_str(), "push" | "range") {
                return reject(&format!("'{name}()'"));
            }
            args.iter().try_for_each(|e| check_pure(e, source, fields))
        }
        Expr::ToolCall { .. } => reject("tool calls"),
        Expr::Parallel { .. } => reject("'parallel'"),
    }
}

struct Evaluator<'a> {
    args: &'a Value,
    ctx: &'a PolicyContext,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, String> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var { name, .. } => Ok(self.args.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Context { name, .. } => Ok(self.ctx.lookup(name)),
            Expr::Array(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (k, e) in entries {
                    map.insert(k.clone(), self.eval(e)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Field {
                target,
                field,
                line,
            } => match self.eval(target)? {
                Value::Null => Ok(Value::Null),
                t => value::field(&t, field, *line).map_err(|e| e.to_string()),
            },
            Expr::Index {
                target,
                index,
                line,
            } => match self.eval(target)? {
                Value::Null => Ok(Value::Null),
                t => value::index(&t, &self.eval(index)?, *line).map_err(|e| e.to_string()),
            },
            Expr::Unary { op, operand, .. } => {
                let v = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value::truthy(&v))),
                    UnaryOp::Neg => match v.as_i64() {
                        Some(i) => Ok(Value::from(-i)),
                        None => v
                            .as_f64()
                            .map(|f| serde_json::json!(-f))
                            .ok_or_else(|| format!("cannot negate {}", value::type_name(&v))),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs, line } => self.binary(*op, lhs, rhs, *line),
            Expr::Builtin { name, args, .. } => self.builtin(name, args),
            Expr::ToolCall { .. } | Expr::Parallel { .. } => {
                Err("tool calls are not allowed in predicates".into())
            }
        }
    }

    fn binary(&self, op: BinOp, lhs: &Expr, rhs: &Expr, line: usize) -> Result<Value, String> {
        match op {
            BinOp::And => {
                let l = self.eval(lhs)?;
                if !value::truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(value::truthy(&self.eval(rhs)?)))
            }
            BinOp::Or => {
                let l = self.eval(lhs)?;
                if value::truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(value::truthy(&self.eval(rhs)?)))
            }
            _ => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                if l.is_null() || r.is_null() {
                    // Missing fields never satisfy a comparison.
                    return Ok(Value::Bool(match op {
                        BinOp::Eq => l.is_null() && r.is_null(),
                        BinOp::Ne => l.is_null() != r.is_null(),
                        _ => false,
                    }));
                }
                value::binary(op, &l, &r, line).map_err(|e| e.to_string())
            }
        }
    }

    fn builtin(&self, name: &str, args: &[Expr]) -> Result<Value, String> {
        let values = args
            .iter()
            .map(|e| self.eval(e))
            .collect::<Result<Vec<_>, _>>()?;
        match (name, values.as_slice()) {
            ("has", [v]) => Ok(Value::Bool(!v.is_null())),
            ("has", [Value::Object(map), Value::String(key)]) => {
                Ok(Value::Bool(map.get(key).is_some_and(|v| !v.is_null())))
            }
            ("len", [Value::String(s)]) => Ok(Value::from(s.chars().count())),
            ("len", [Value::Array(a)]) => Ok(Value::from(a.len())),
            ("len", [Value::Object(m)]) => Ok(Value::from(m.len())),
            ("len", [Value::Null]) => Ok(Value::Null),
            ("str", [v]) => Ok(Value::String(value::display(v))),
            ("int", [v]) => to_int(v).map(Value::from),
            ("keys", [Value::Object(m)]) => Ok(Value::Array(
                m.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            _ => Err(format!("invalid call to {name}() in predicate")),
        }
    }
}

fn to_int(v: &Value) -> Result<i64, String> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| "number out of range".to_string()),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{s}' is not an integer")),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("cannot convert {} to an integer", value::type_name(other))),
    }
}
