//! Repair diagnostics: what went wrong, phrased so the model can fix it.

use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorKind, WardenError};
use crate::sandbox::CallRecord;
use crate::schema::{ParamSpec, ToolCatalog};

/// Everything the generator is told about a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The schema signature or constraint the code ran into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_fragment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Arguments of the failing call, when the failure happened at run time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Diagnostic {
    /// Builds a diagnostic from the error that ended an attempt, the
    /// catalog the code was written against, and the attempt's trace.
    pub fn from_error(error: &WardenError, catalog: &ToolCatalog, trace: &[CallRecord]) -> Self {
        let tool = error.tool().map(str::to_string);
        let field = error.field().map(str::to_string);
        let schema = tool.as_deref().and_then(|t| catalog.get(t));
        let param = match (schema, field.as_deref()) {
            (Some(schema), Some(field)) => schema.param(field),
            _ => None,
        };

        let schema_fragment = match error {
            WardenError::ConstraintViolation { constraint, .. } => Some(match param {
                Some(p) => format!("{constraint}; parameter {}", describe_param(p)),
                None => constraint.clone(),
            }),
            _ => schema.map(|s| s.signature()),
        };

        let suggestion = match error {
            WardenError::UnknownTool { tool } => catalog
                .closest(tool)
                .map(|hit| format!("no tool named '{tool}' exists; did you mean '{hit}'?")),
            WardenError::ConstraintViolation { suggestion, .. } => suggestion
                .clone()
                .or_else(|| param.map(|p| format!("pass {}", describe_param(p)))),
            WardenError::StaticSchemaViolation { .. } => {
                param.map(|p| format!("pass {}", describe_param(p)))
            }
            WardenError::ScriptError { line, .. } => {
                Some(format!("fix the statement at line {line}"))
            }
            WardenError::Timeout { limit_ms } => Some(format!(
                "the program must finish within {limit_ms}ms; remove unbounded loops"
            )),
            WardenError::ResourceExhausted { resource, limit } => Some(format!(
                "stay under the {resource} limit of {limit}; batch or narrow the calls"
            )),
            WardenError::ToolError { .. } => Some(
                "the tool back-end failed; check the arguments or avoid this call".to_string(),
            ),
            _ => None,
        };

        let arguments = tool.as_deref().and_then(|t| {
            trace
                .iter()
                .rev()
                .find(|r| r.tool == t && r.error_kind == Some(error.kind()))
                .map(|r| r.arguments.clone())
        });

        Self {
            kind: error.kind(),
            message: error.to_string(),
            tool,
            field,
            schema_fragment,
            suggestion,
            arguments,
        }
    }

    /// Plain-text rendering used in the repair prompt.
    pub fn render(&self) -> String {
        let kind = serde_json::to_value(self.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let mut out = format!("Error ({kind}): {}\n", self.message);
        if let Some(ref tool) = self.tool {
            out.push_str(&format!("Tool: {tool}\n"));
        }
        if let Some(ref field) = self.field {
            out.push_str(&format!("Field: {field}\n"));
        }
        if let Some(ref fragment) = self.schema_fragment {
            out.push_str(&format!("Schema: {fragment}\n"));
        }
        if let Some(ref args) = self.arguments {
            out.push_str(&format!("Arguments sent: {args}\n"));
        }
        if let Some(ref suggestion) = self.suggestion {
            out.push_str(&format!("Suggested fix: {suggestion}\n"));
        }
        out
    }
}

/// e.g. `'recordId' (required string matching /^00Q/)`.
fn describe_param(p: &ParamSpec) -> String {
    let mut s = format!(
        "'{}' ({} {}",
        p.name,
        if p.required { "required" } else { "optional" },
        p.param_type.as_str()
    );
    if let Some(ref pattern) = p.pattern {
        s.push_str(&format!(" matching /{pattern}/"));
    }
    if let Some(ref bounds) = p.bounds {
        s.push_str(&format!(" within {}", bounds.describe()));
    }
    s.push(')');
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CallOutcome;
    use crate::schema::ToolSchema;
    use chrono::Utc;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        let schemas: Vec<ToolSchema> = serde_json::from_value(json!([
            {"name": "salesforce.read.getLead", "parameters": [
                {"name": "recordId", "type": "string", "required": true,
                 "pattern": "^00Q[a-zA-Z0-9]{15}$"}
            ]},
            {"name": "salesforce.write.createContact", "parameters": [
                {"name": "Email", "type": "string", "required": true}
            ]}
        ]))
        .unwrap();
        ToolCatalog::new(schemas)
    }

    #[test]
    fn test_constraint_violation_carries_pattern() {
        let error = WardenError::ConstraintViolation {
            tool: "salesforce.read.getLead".into(),
            constraint: "field_pattern(recordId)".into(),
            field: Some("recordId".into()),
            reason: "'bad' does not match".into(),
            suggestion: None,
        };
        let trace = vec![CallRecord {
            seq: 0,
            tool: "salesforce.read.getLead".into(),
            arguments: json!({"recordId": "bad"}),
            constraints: vec![],
            outcome: CallOutcome::Denied,
            error_kind: Some(ErrorKind::ConstraintViolation),
            error: Some(error.to_string()),
            response: None,
            timestamp: Utc::now(),
            duration_ms: 0,
        }];
        let d = Diagnostic::from_error(&error, &catalog(), &trace);
        assert_eq!(d.kind, ErrorKind::ConstraintViolation);
        assert_eq!(d.field.as_deref(), Some("recordId"));
        assert!(d.schema_fragment.unwrap().contains("^00Q[a-zA-Z0-9]{15}$"));
        assert!(d.suggestion.unwrap().contains("matching /^00Q"));
        assert_eq!(d.arguments, Some(json!({"recordId": "bad"})));
    }

    #[test]
    fn test_missing_required_field() {
        let error = WardenError::StaticSchemaViolation {
            tool: "salesforce.write.createContact".into(),
            field: "Email".into(),
            reason: "required field is missing".into(),
            line: 1,
        };
        let d = Diagnostic::from_error(&error, &catalog(), &[]);
        assert_eq!(
            d.schema_fragment.as_deref(),
            Some("salesforce.write.createContact({Email: string}) [write]")
        );
        assert_eq!(d.suggestion.as_deref(), Some("pass 'Email' (required string)"));
        assert!(d.arguments.is_none());
    }

    #[test]
    fn test_unknown_tool_hint() {
        let error = WardenError::UnknownTool {
            tool: "salesforce.getLead".into(),
        };
        let d = Diagnostic::from_error(&error, &catalog(), &[]);
        assert!(d.schema_fragment.is_none());
        assert!(d
            .suggestion
            .unwrap()
            .contains("did you mean 'salesforce.read.getLead'"));
    }

    #[test]
    fn test_render() {
        let error = WardenError::Timeout { limit_ms: 2000 };
        let text = Diagnostic::from_error(&error, &catalog(), &[]).render();
        assert!(text.starts_with("Error (timeout): execution timed out after 2000ms"));
        assert!(text.contains("Suggested fix: the program must finish within 2000ms"));
        assert!(!text.contains("Tool:"));
    }
}
