//! Pre-execution check of generated code.
//!
//! One pass over the syntax tree, before anything runs. Every statically
//! named tool must exist in the session catalog, and arguments that are
//! known without running anything (literals, or variables bound to
//! literals in straight-line code) are checked against the tool schema.
//! Everything else is left to the runtime guard.
//!
//! This is an early filter for obviously broken code, not a proof: a
//! clean report does not mean the guard will accept every call.

use std::collections::{BTreeSet, HashMap, HashSet};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::WardenError;
use crate::schema::{ToolCatalog, ToolSchema};
use crate::script::value::type_name;
use crate::script::{parse_program, CallTarget, Expr, Program, Stmt, UnaryOp};

/// What the analyzer looked at and what it had to leave for run time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisReport {
    /// Distinct tools the code names.
    pub tools: BTreeSet<String>,
    /// Call sites with a static target.
    pub static_calls: usize,
    /// `call(expr, ...)` sites whose target is only known at run time.
    pub dynamic_calls: usize,
    /// Static call sites whose arguments could not be inspected at all.
    pub deferred_calls: usize,
    /// Individual argument fields whose value is only known at run time.
    pub deferred_fields: usize,
}

impl AnalysisReport {
    pub fn fully_checked(&self) -> bool {
        self.dynamic_calls == 0 && self.deferred_calls == 0 && self.deferred_fields == 0
    }
}

/// Variables currently bound to a value known at analysis time.
type Constants = HashMap<String, Value>;

pub struct StaticAnalyzer<'a> {
    catalog: &'a ToolCatalog,
}

impl<'a> StaticAnalyzer<'a> {
    pub fn new(catalog: &'a ToolCatalog) -> Self {
        Self { catalog }
    }

    /// Parses then analyzes. A parse failure is a `ScriptError`.
    pub fn check_source(&self, code: &str) -> Result<(Program, AnalysisReport), WardenError> {
        let program = parse_program(code)?;
        let report = self.analyze(&program)?;
        Ok((program, report))
    }

    pub fn analyze(&self, program: &Program) -> Result<AnalysisReport, WardenError> {
        let mut report = AnalysisReport::default();
        let mut consts = Constants::new();
        self.block(&program.body, &mut consts, &mut report)?;
        debug!(
            "Static analysis: {} tool(s), {} static / {} dynamic call(s), {} deferred field(s)",
            report.tools.len(),
            report.static_calls,
            report.dynamic_calls,
            report.deferred_fields
        );
        Ok(report)
    }

    // ── Statements ─────────────────────────────────────

    fn block(
        &self,
        body: &[Stmt],
        consts: &mut Constants,
        report: &mut AnalysisReport,
    ) -> Result<(), WardenError> {
        for stmt in body {
            self.stmt(stmt, consts, report)?;
        }
        Ok(())
    }

    /// Analyzes a nested block with its own scope. Lets inside do not
    /// leak out; anything the block assigns is no longer constant after it.
    fn scoped(
        &self,
        body: &[Stmt],
        consts: &mut Constants,
        report: &mut AnalysisReport,
        looping: bool,
    ) -> Result<(), WardenError> {
        let mut assigned = HashSet::new();
        assigned_names(body, &mut assigned);
        if looping {
            // A later iteration may see any value the body assigns.
            for name in &assigned {
                consts.remove(name);
            }
        }
        let mut inner = consts.clone();
        self.block(body, &mut inner, report)?;
        for name in &assigned {
            consts.remove(name);
        }
        Ok(())
    }

    fn stmt(
        &self,
        stmt: &Stmt,
        consts: &mut Constants,
        report: &mut AnalysisReport,
    ) -> Result<(), WardenError> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                self.expr(value, consts, report)?;
                match const_eval(value, consts) {
                    Some(v) => consts.insert(name.clone(), v),
                    None => consts.remove(name),
                };
            }
            Stmt::Assign { name, value, .. } => {
                self.expr(value, consts, report)?;
                consts.remove(name);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                self.expr(cond, consts, report)?;
                self.scoped(then_body, consts, report, false)?;
                if let Some(else_body) = else_body {
                    self.scoped(else_body, consts, report, false)?;
                }
            }
            Stmt::While { cond, body, .. } => {
                let mut assigned = HashSet::new();
                assigned_names(body, &mut assigned);
                for name in &assigned {
                    consts.remove(name);
                }
                self.expr(cond, consts, report)?;
                self.scoped(body, consts, report, true)?;
            }
            Stmt::Loop { body, .. } => self.scoped(body, consts, report, true)?,
            Stmt::For { var, iter, body, .. } => {
                self.expr(iter, consts, report)?;
                let shadowed = consts.remove(var);
                self.scoped(body, consts, report, true)?;
                if let Some(v) = shadowed {
                    if !assigned_in(body, var) {
                        consts.insert(var.clone(), v);
                    }
                }
            }
            Stmt::Return {
                value: Some(value), ..
            }
            | Stmt::Expr { expr: value, .. } => self.expr(value, consts, report)?,
            Stmt::Return { value: None, .. } | Stmt::Break { .. } | Stmt::Continue { .. } => {}
        }
        Ok(())
    }

    // ── Expressions ────────────────────────────────────

    fn expr(
        &self,
        expr: &Expr,
        consts: &Constants,
        report: &mut AnalysisReport,
    ) -> Result<(), WardenError> {
        match expr {
            Expr::Literal(_) | Expr::Var { .. } | Expr::Context { .. } => Ok(()),
            Expr::Array(items) | Expr::Parallel { items, .. } => items
                .iter()
                .try_for_each(|e| self.expr(e, consts, report)),
            Expr::Object(entries) => entries
                .iter()
                .try_for_each(|(_, e)| self.expr(e, consts, report)),
            Expr::Field { target, .. } => self.expr(target, consts, report),
            Expr::Index { target, index, .. } => {
                self.expr(target, consts, report)?;
                self.expr(index, consts, report)
            }
            Expr::Unary { operand, .. } => self.expr(operand, consts, report),
            Expr::Binary { lhs, rhs, .. } => {
                self.expr(lhs, consts, report)?;
                self.expr(rhs, consts, report)
            }
            Expr::Builtin { args, .. } => args.iter().try_for_each(|e| self.expr(e, consts, report)),
            Expr::ToolCall { target, args, line } => {
                if let Some(args) = args {
                    self.expr(args, consts, report)?;
                }
                let name = match target {
                    CallTarget::Static(name) => Some(name.clone()),
                    CallTarget::Dynamic(name_expr) => {
                        self.expr(name_expr, consts, report)?;
                        match const_eval(name_expr, consts) {
                            Some(Value::String(s)) => Some(s),
                            _ => None,
                        }
                    }
                };
                match name {
                    Some(name) => self.tool_call(&name, args.as_deref(), *line, consts, report),
                    None => {
                        report.dynamic_calls += 1;
                        Ok(())
                    }
                }
            }
        }
    }

    fn tool_call(
        &self,
        name: &str,
        args: Option<&Expr>,
        line: usize,
        consts: &Constants,
        report: &mut AnalysisReport,
    ) -> Result<(), WardenError> {
        let schema = self.catalog.get(name).ok_or_else(|| WardenError::UnknownTool {
            tool: name.to_string(),
        })?;
        report.static_calls += 1;
        report.tools.insert(name.to_string());

        let shape = match args {
            None => Some(Vec::new()),
            Some(expr) => argument_shape(expr, consts, name, line)?,
        };
        match shape {
            Some(fields) => check_fields(schema, &fields, line, report),
            None => {
                report.deferred_calls += 1;
                Ok(())
            }
        }
    }
}

// ── Constant folding ───────────────────────────────────

/// The value of `expr` if it is known without running anything.
fn const_eval(expr: &Expr, consts: &Constants) -> Option<Value> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        Expr::Var { name, .. } => consts.get(name).cloned(),
        Expr::Array(items) => items
            .iter()
            .map(|e| const_eval(e, consts))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Expr::Object(entries) => {
            let mut map = serde_json::Map::new();
            for (k, e) in entries {
                map.insert(k.clone(), const_eval(e, consts)?);
            }
            Some(Value::Object(map))
        }
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
            ..
        } => match const_eval(operand, consts)? {
            Value::Number(n) => match n.as_i64() {
                Some(i) => i.checked_neg().map(Value::from),
                None => n.as_f64().and_then(|f| serde_json::Number::from_f64(-f)).map(Value::Number),
            },
            _ => None,
        },
        _ => None,
    }
}

/// Known argument keys, each with its value when that is known too.
/// `None` when not even the set of keys is known.
type Shape = Vec<(String, Option<Value>)>;

fn argument_shape(
    expr: &Expr,
    consts: &Constants,
    tool: &str,
    line: usize,
) -> Result<Option<Shape>, WardenError> {
    if let Expr::Object(entries) = expr {
        return Ok(Some(
            entries
                .iter()
                .map(|(k, e)| (k.clone(), const_eval(e, consts)))
                .collect(),
        ));
    }
    match const_eval(expr, consts) {
        Some(Value::Object(map)) => Ok(Some(map.into_iter().map(|(k, v)| (k, Some(v))).collect())),
        Some(other) => Err(WardenError::StaticSchemaViolation {
            tool: tool.to_string(),
            field: "(arguments)".into(),
            reason: format!("arguments must be an object, not {}", type_name(&other)),
            line,
        }),
        None => Ok(None),
    }
}

fn check_fields(
    schema: &ToolSchema,
    fields: &Shape,
    line: usize,
    report: &mut AnalysisReport,
) -> Result<(), WardenError> {
    let violation = |field: &str, reason: String| WardenError::StaticSchemaViolation {
        tool: schema.name.clone(),
        field: field.to_string(),
        reason,
        line,
    };

    for p in &schema.parameters {
        let entry = fields.iter().find(|(k, _)| k == &p.name).map(|(_, v)| v);
        let value = match entry {
            None | Some(Some(Value::Null)) => {
                if p.required {
                    return Err(violation(&p.name, "required field is missing".into()));
                }
                continue;
            }
            Some(None) => {
                report.deferred_fields += 1;
                continue;
            }
            Some(Some(v)) => v,
        };

        if !p.param_type.accepts(value) {
            return Err(violation(
                &p.name,
                format!("expected {}, got {}", p.param_type.as_str(), type_name(value)),
            ));
        }
        if let (Some(pattern), Value::String(s)) = (&p.pattern, value) {
            let re = Regex::new(pattern).map_err(|e| {
                WardenError::malformed(format!("pattern for '{}.{}': {e}", schema.name, p.name))
            })?;
            if !re.is_match(s) {
                return Err(violation(
                    &p.name,
                    format!("value '{s}' does not match /{pattern}/"),
                ));
            }
        }
        if let Some(bounds) = p.bounds {
            let measure = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => Some(s.chars().count() as f64),
                Value::Array(a) => Some(a.len() as f64),
                _ => None,
            };
            if let Some(m) = measure {
                if !bounds.contains(m) {
                    return Err(violation(
                        &p.name,
                        format!("{m} is outside {}", bounds.describe()),
                    ));
                }
            }
        }
    }
    Ok(())
}

// ── Assignment scan ────────────────────────────────────

/// Names assigned (not let-bound) anywhere in `body`, nested blocks included.
fn assigned_names(body: &[Stmt], out: &mut HashSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::Assign { name, .. } => {
                out.insert(name.clone());
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                assigned_names(then_body, out);
                if let Some(else_body) = else_body {
                    assigned_names(else_body, out);
                }
            }
            Stmt::While { body, .. } | Stmt::Loop { body, .. } | Stmt::For { body, .. } => {
                assigned_names(body, out)
            }
            _ => {}
        }
    }
}

fn assigned_in(body: &[Stmt], name: &str) -> bool {
    let mut names = HashSet::new();
    assigned_names(body, &mut names);
    names.contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        let schemas: Vec<ToolSchema> = serde_json::from_value(json!([
            {
                "name": "salesforce.read.getLead",
                "parameters": [
                    {"name": "recordId", "type": "string", "required": true,
                     "pattern": "^00Q[a-zA-Z0-9]{15}$"}
                ]
            },
            {
                "name": "salesforce.write.createLead",
                "parameters": [
                    {"name": "LastName", "type": "string", "required": true},
                    {"name": "Email", "type": "string", "required": true},
                    {"name": "Score", "type": "integer", "bounds": {"min": 0, "max": 100}}
                ]
            }
        ]))
        .unwrap();
        ToolCatalog::new(schemas)
    }

    fn analyze(code: &str) -> Result<AnalysisReport, WardenError> {
        let catalog = catalog();
        StaticAnalyzer::new(&catalog).check_source(code).map(|(_, r)| r)
    }

    #[test]
    fn test_clean_program() {
        let report = analyze(
            r#"
            let lead = salesforce.read.getLead({recordId: "00Q000000000000AAA"});
            return lead.Id;
            "#,
        )
        .unwrap();
        assert_eq!(report.static_calls, 1);
        assert!(report.fully_checked());
        assert!(report.tools.contains("salesforce.read.getLead"));
    }

    #[test]
    fn test_unknown_tool() {
        let err = analyze(r#"salesforce.read.getLeads({recordId: "x"});"#).unwrap_err();
        assert_eq!(
            err,
            WardenError::UnknownTool {
                tool: "salesforce.read.getLeads".into()
            }
        );
    }

    #[test]
    fn test_unknown_tool_inside_loop_body() {
        let err = analyze("for i in range(3) { jira.read.getIssue({id: i}); }").unwrap_err();
        assert!(matches!(err, WardenError::UnknownTool { .. }));
    }

    #[test]
    fn test_missing_required_field() {
        let err =
            analyze(r#"salesforce.write.createLead({LastName: "Doe"});"#).unwrap_err();
        match err {
            WardenError::StaticSchemaViolation { field, line, .. } => {
                assert_eq!(field, "Email");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_literal_pattern_violation() {
        let err = analyze(r#"salesforce.read.getLead({recordId: "bad"});"#).unwrap_err();
        assert_eq!(err.field(), Some("recordId"));
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_literal_type_and_bounds() {
        let err = analyze(
            r#"salesforce.write.createLead({LastName: "D", Email: "d@x", Score: "high"});"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected integer, got string"));

        let err = analyze(
            r#"salesforce.write.createLead({LastName: "D", Email: "d@x", Score: 140});"#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("Score"));
    }

    #[test]
    fn test_let_bound_literals_are_followed() {
        let err = analyze(
            r#"
            let args = {LastName: "Doe"};
            salesforce.write.createLead(args);
            "#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("Email"));

        let err = analyze(
            r#"
            let id = "nope";
            salesforce.read.getLead({recordId: id});
            "#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("recordId"));
    }

    #[test]
    fn test_runtime_values_are_deferred() {
        let report = analyze(
            r#"
            let lead = salesforce.read.getLead({recordId: "00Q000000000000AAA"});
            salesforce.write.createLead({LastName: lead.LastName, Email: lead.Email});
            let args = lead;
            salesforce.write.createLead(args);
            "#,
        )
        .unwrap();
        assert_eq!(report.static_calls, 3);
        assert_eq!(report.deferred_fields, 2);
        assert_eq!(report.deferred_calls, 1);
        assert!(!report.fully_checked());
    }

    #[test]
    fn test_loop_assignments_are_not_constant() {
        let report = analyze(
            r#"
            let id = "00Q000000000000AAA";
            while true {
                salesforce.read.getLead({recordId: id});
                id = "bad";
            }
            "#,
        )
        .unwrap();
        assert_eq!(report.deferred_fields, 1);

        // After a branch that reassigns, the value is unknown.
        let report = analyze(
            r#"
            let id = "bad";
            if x { id = "00Q000000000000AAA"; }
            salesforce.read.getLead({recordId: id});
            "#,
        )
        .unwrap();
        assert_eq!(report.deferred_fields, 1);
    }

    #[test]
    fn test_dynamic_targets() {
        let report = analyze(r#"let t = pick(); call(t, {});"#);
        // `pick` is itself an unknown tool.
        assert!(matches!(report, Err(WardenError::UnknownTool { .. })));

        let report = analyze(
            r#"
            let names = ["salesforce.read.getLead"];
            for n in names { call(n, {recordId: "00Q000000000000AAA"}); }
            "#,
        )
        .unwrap();
        assert_eq!(report.dynamic_calls, 1);

        let err = analyze(r#"let t = "nope.tool"; call(t, {});"#).unwrap_err();
        assert!(matches!(err, WardenError::UnknownTool { .. }));
    }

    #[test]
    fn test_non_object_arguments() {
        let err = analyze("salesforce.read.getLead(5);").unwrap_err();
        assert!(matches!(err, WardenError::StaticSchemaViolation { .. }));
    }

    #[test]
    fn test_parse_errors_surface_as_script_errors() {
        let err = analyze("let = 3;").unwrap_err();
        assert!(matches!(err, WardenError::ScriptError { .. }));
    }

    #[test]
    fn test_deep_expression_is_a_script_error() {
        let code = format!("let x = 0; return x{}", " + x".repeat(10_000));
        let err = analyze(&code).unwrap_err();
        assert!(matches!(err, WardenError::ScriptError { .. }));
    }

    #[test]
    fn test_parallel_calls_are_checked() {
        let err = analyze(
            r#"let r = parallel [
                salesforce.read.getLead({recordId: "00Q000000000000AAA"}),
                salesforce.read.getLead({recordId: "bad"})
            ];"#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("recordId"));
    }
}
