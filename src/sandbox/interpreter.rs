//! Tree-walking interpreter for warden script.
//!
//! The interpreter has no effects of its own: tool calls go to the
//! [`RuntimeGuard`], everything else is pure computation over JSON
//! values. It yields to the host runtime every few steps so the
//! executor's deadline can pre-empt a runaway loop, and it stops as
//! soon as the guard is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{Map, Value};

use super::guard::RuntimeGuard;
use crate::error::WardenError;
use crate::script::ast::{BinOp, CallTarget, Expr, Program, Stmt, UnaryOp};
use crate::script::value::{self, approx_size, nesting_depth, type_name};

/// Steps between cooperative yields.
const YIELD_EVERY: u64 = 128;

/// Deepest array/object nesting a program may build.
const MAX_VALUE_DEPTH: usize = 64;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Block-scoped variable bindings with a running size estimate.
#[derive(Default)]
struct Env {
    scopes: Vec<HashMap<String, Value>>,
    bytes: usize,
}

impl Env {
    fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            bytes: 0,
        }
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            let freed: usize = scope.iter().map(|(k, v)| k.len() + approx_size(v)).sum();
            self.bytes = self.bytes.saturating_sub(freed);
        }
    }
}

pub struct Interpreter<'g> {
    guard: &'g RuntimeGuard,
    memory_limit: usize,
    steps: AtomicU64,
}

impl<'g> Interpreter<'g> {
    pub fn new(guard: &'g RuntimeGuard, memory_limit: usize) -> Self {
        Self {
            guard,
            memory_limit,
            steps: AtomicU64::new(0),
        }
    }

    /// Runs a program to completion. The value of the first top-level
    /// `return`, or `null` when the program falls off the end.
    pub async fn run(&self, program: &Program) -> Result<Value, WardenError> {
        let mut env = Env::new();
        match self.block(&program.body, &mut env).await? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::Null),
            Flow::Break | Flow::Continue => Err(WardenError::script(
                0,
                "'break' or 'continue' outside of a loop",
            )),
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Counts a step, yields periodically, and stops a cancelled run.
    async fn step(&self) -> Result<(), WardenError> {
        let n = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        if n % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        if self.guard.is_cancelled() {
            return Err(self
                .guard
                .abort_reason()
                .unwrap_or_else(|| self.guard.timeout_error()));
        }
        Ok(())
    }

    fn out_of_memory(&self) -> WardenError {
        WardenError::ResourceExhausted {
            resource: "memory".into(),
            limit: self.memory_limit as u64,
        }
    }

    /// Fails if holding `extra` more bytes alongside the environment
    /// would exceed the ceiling.
    fn charge(&self, env: &Env, extra: usize) -> Result<(), WardenError> {
        if env.bytes.saturating_add(extra) > self.memory_limit {
            return Err(self.out_of_memory());
        }
        Ok(())
    }

    fn bind(&self, env: &mut Env, name: &str, v: Value) -> Result<(), WardenError> {
        let size = name.len() + approx_size(&v);
        self.charge(env, size)?;
        let scope = env.scopes.last_mut().ok_or_else(|| WardenError::script(0, "no scope"))?;
        if let Some(old) = scope.insert(name.to_string(), v) {
            env.bytes = env.bytes.saturating_sub(name.len() + approx_size(&old));
        }
        env.bytes += size;
        Ok(())
    }

    fn assign(&self, env: &mut Env, name: &str, v: Value, line: usize) -> Result<(), WardenError> {
        let new_size = approx_size(&v);
        let old_size = env
            .get(name)
            .map(approx_size)
            .ok_or_else(|| WardenError::script(line, format!("assignment to undeclared variable '{name}'")))?;
        let projected = env.bytes.saturating_sub(old_size).saturating_add(new_size);
        if projected > self.memory_limit {
            return Err(self.out_of_memory());
        }
        for scope in env.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = v;
                break;
            }
        }
        env.bytes = projected;
        Ok(())
    }

    // ── Statements ─────────────────────────────────────

    fn block<'a>(&'a self, body: &'a [Stmt], env: &'a mut Env) -> BoxFuture<'a, Result<Flow, WardenError>> {
        async move {
            for stmt in body {
                match self.stmt(stmt, env).await? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    /// Runs `body` in a fresh scope.
    async fn scoped(&self, body: &[Stmt], env: &mut Env) -> Result<Flow, WardenError> {
        env.push();
        let flow = self.block(body, env).await;
        env.pop();
        flow
    }

    async fn stmt(&self, stmt: &Stmt, env: &mut Env) -> Result<Flow, WardenError> {
        self.step().await?;
        match stmt {
            Stmt::Let { name, value, .. } => {
                let v = self.eval(value, env).await?;
                self.bind(env, name, v)?;
            }
            Stmt::Assign { name, value, line } => {
                let v = self.eval(value, env).await?;
                self.assign(env, name, v, *line)?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                let c = self.eval(cond, env).await?;
                if value::truthy(&c) {
                    return self.scoped(then_body, env).await;
                } else if let Some(else_body) = else_body {
                    return self.scoped(else_body, env).await;
                }
            }
            Stmt::While { cond, body, .. } => loop {
                self.step().await?;
                let c = self.eval(cond, env).await?;
                if !value::truthy(&c) {
                    break;
                }
                match self.scoped(body, env).await? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            Stmt::Loop { body, .. } => loop {
                self.step().await?;
                match self.scoped(body, env).await? {
                    Flow::Break => break,
                    Flow::Return(v) => return Ok(Flow::Return(v)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            Stmt::For {
                var,
                iter,
                body,
                line,
            } => {
                let items = match self.eval(iter, env).await? {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(k, _)| Value::String(k)).collect(),
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => {
                        return Err(WardenError::script(
                            *line,
                            format!("cannot iterate over {}", type_name(&other)),
                        ))
                    }
                };
                for item in items {
                    self.step().await?;
                    env.push();
                    let flow = match self.bind(env, var, item) {
                        Ok(()) => self.block(body, env).await,
                        Err(e) => Err(e),
                    };
                    env.pop();
                    match flow? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            Stmt::Break { .. } => return Ok(Flow::Break),
            Stmt::Continue { .. } => return Ok(Flow::Continue),
            Stmt::Return { value, .. } => {
                let v = match value {
                    Some(e) => self.eval(e, env).await?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(v));
            }
            Stmt::Expr { expr, .. } => {
                self.eval(expr, env).await?;
            }
        }
        Ok(Flow::Normal)
    }

    // ── Expressions ────────────────────────────────────

    fn eval<'a>(&'a self, expr: &'a Expr, env: &'a Env) -> BoxFuture<'a, Result<Value, WardenError>> {
        async move {
            self.step().await?;
            match expr {
                Expr::Literal(v) => Ok(v.clone()),
                Expr::Var { name, line } => env
                    .get(name)
                    .cloned()
                    .ok_or_else(|| WardenError::script(*line, format!("undefined variable '{name}'"))),
                Expr::Context { name, line } => Err(WardenError::script(
                    *line,
                    format!("'${name}' is not available in generated code"),
                )),
                Expr::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for e in items {
                        out.push(self.eval(e, env).await?);
                    }
                    check_nesting(Value::Array(out), 0)
                }
                Expr::Object(entries) => {
                    let mut map = Map::new();
                    for (k, e) in entries {
                        map.insert(k.clone(), self.eval(e, env).await?);
                    }
                    check_nesting(Value::Object(map), 0)
                }
                Expr::Field { target, field, line } => {
                    let t = self.eval(target, env).await?;
                    value::field(&t, field, *line)
                }
                Expr::Index { target, index, line } => {
                    let t = self.eval(target, env).await?;
                    let i = self.eval(index, env).await?;
                    value::index(&t, &i, *line)
                }
                Expr::Unary { op, operand, line } => {
                    let v = self.eval(operand, env).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!value::truthy(&v))),
                        UnaryOp::Neg => value::binary(BinOp::Sub, &Value::from(0), &v, *line),
                    }
                }
                Expr::Binary { op, lhs, rhs, line } => self.binary(*op, lhs, rhs, *line, env).await,
                Expr::Builtin { name, args, line } => {
                    let mut values = Vec::with_capacity(args.len());
                    for e in args {
                        values.push(self.eval(e, env).await?);
                    }
                    self.builtin(name, values, *line, env)
                }
                Expr::ToolCall { target, args, line } => {
                    let name = match target {
                        CallTarget::Static(name) => name.clone(),
                        CallTarget::Dynamic(e) => match self.eval(e, env).await? {
                            Value::String(s) => s,
                            other => {
                                return Err(WardenError::script(
                                    *line,
                                    format!("tool name must be a string, not {}", type_name(&other)),
                                ))
                            }
                        },
                    };
                    let args = match args {
                        Some(e) => self.eval(e, env).await?,
                        None => Value::Object(Map::new()),
                    };
                    if !args.is_object() {
                        return Err(WardenError::script(
                            *line,
                            format!("arguments to '{name}' must be an object, not {}", type_name(&args)),
                        ));
                    }
                    let response = self.guard.call(&name, args).await?;
                    self.charge(env, approx_size(&response))?;
                    Ok(response)
                }
                Expr::Parallel { items, .. } => {
                    let results = join_all(items.iter().map(|e| self.eval(e, env))).await;
                    let values = results.into_iter().collect::<Result<Vec<_>, _>>()?;
                    let out = Value::Array(values);
                    self.charge(env, approx_size(&out))?;
                    Ok(out)
                }
            }
        }
        .boxed()
    }

    async fn binary(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: usize,
        env: &Env,
    ) -> Result<Value, WardenError> {
        let l = self.eval(lhs, env).await?;
        match op {
            BinOp::And if !value::truthy(&l) => return Ok(Value::Bool(false)),
            BinOp::Or if value::truthy(&l) => return Ok(Value::Bool(true)),
            _ => {}
        }
        let r = self.eval(rhs, env).await?;
        if op == BinOp::Add {
            let projected = match (&l, &r) {
                (Value::String(_), _) | (_, Value::String(_)) | (Value::Array(_), Value::Array(_)) => {
                    approx_size(&l) + approx_size(&r)
                }
                _ => 0,
            };
            self.charge(env, projected)?;
        }
        value::binary(op, &l, &r, line)
    }

    fn builtin(&self, name: &str, args: Vec<Value>, line: usize, env: &Env) -> Result<Value, WardenError> {
        let bad = || {
            WardenError::script(
                line,
                format!(
                    "invalid arguments to {name}({})",
                    args.iter().map(type_name).collect::<Vec<_>>().join(", ")
                ),
            )
        };
        match (name, args.as_slice()) {
            ("len", [Value::String(s)]) => Ok(Value::from(s.chars().count())),
            ("len", [Value::Array(a)]) => Ok(Value::from(a.len())),
            ("len", [Value::Object(m)]) => Ok(Value::from(m.len())),
            ("str", [v]) => Ok(Value::String(value::display(v))),
            ("int", [v]) => to_int(v, line).map(Value::from),
            ("keys", [Value::Object(m)]) => Ok(Value::Array(
                m.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            ("range", [end]) => self.range(0, end.as_i64().ok_or_else(bad)?, env),
            ("range", [start, end]) => self.range(
                start.as_i64().ok_or_else(bad)?,
                end.as_i64().ok_or_else(bad)?,
                env,
            ),
            ("push", [Value::Array(a), v]) => {
                self.charge(env, approx_size(&args[0]) + approx_size(v))?;
                let mut out = a.clone();
                out.push(v.clone());
                check_nesting(Value::Array(out), line)
            }
            ("has", [v]) => Ok(Value::Bool(!v.is_null())),
            ("has", [Value::Object(m), Value::String(k)]) => {
                Ok(Value::Bool(m.get(k).is_some_and(|v| !v.is_null())))
            }
            _ => Err(bad()),
        }
    }

    fn range(&self, start: i64, end: i64, env: &Env) -> Result<Value, WardenError> {
        let len = end.saturating_sub(start).max(0) as u64;
        // Each integer costs about as much as `approx_size` says.
        let cost = len.saturating_mul(16).saturating_add(24);
        if cost > usize::MAX as u64 {
            return Err(self.out_of_memory());
        }
        self.charge(env, cost as usize)?;
        Ok(Value::Array((start..end).map(Value::from).collect()))
    }
}

fn check_nesting(v: Value, line: usize) -> Result<Value, WardenError> {
    if nesting_depth(&v) > MAX_VALUE_DEPTH {
        return Err(WardenError::script(line, "value nested too deeply"));
    }
    Ok(v)
}

fn to_int(v: &Value, line: usize) -> Result<i64, WardenError> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or_else(|| WardenError::script(line, "number out of range")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| WardenError::script(line, format!("'{s}' is not an integer"))),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(WardenError::script(
            line,
            format!("cannot convert {} to an integer", type_name(other)),
        )),
    }
}
