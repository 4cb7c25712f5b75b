use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::constraint::Constraint;
use super::PolicyContext;
use crate::schema::ToolSchema;

/// Argument names that usually cap how much a call returns.
const LIMIT_HINTS: &[&str] = &["limit", "maxrecords", "max_records", "pagesize", "page_size", "count"];

/// The narrowest grant that would have allowed a denied call.
///
/// Advisory only: it is shown to whoever administers tokens and is
/// never signed or used by the crate itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantSuggestion {
    pub pattern: String,
    pub operations: BTreeSet<String>,
    pub constraints: Vec<Constraint>,
    pub rationale: String,
}

impl GrantSuggestion {
    /// Builds a suggestion from the call that was denied: an exact tool
    /// pattern, the tool's operation, and restrictions pinning the
    /// arguments that identify the caller or the caller's scope.
    pub fn for_call(schema: &ToolSchema, args: &Value, ctx: &PolicyContext) -> Self {
        let mut constraints = Vec::new();
        let mut notes = Vec::new();

        if let Value::Object(map) = args {
            for (name, value) in map {
                if !is_identifier(name) {
                    continue;
                }
                let lower = name.to_ascii_lowercase();

                if let (Some(principal), Value::String(s)) = (ctx.principal.as_deref(), value) {
                    if s == principal {
                        constraints.push(Constraint::ScopeRestriction {
                            predicate: format!("{name} == $principal"),
                        });
                        notes.push(format!("'{name}' pinned to the principal"));
                        continue;
                    }
                }

                if let Some(attr) = ctx
                    .attributes
                    .iter()
                    .find(|(k, v)| is_identifier(k) && !v.is_null() && *v == value)
                    .map(|(k, _)| k)
                {
                    constraints.push(Constraint::ScopeRestriction {
                        predicate: format!("{name} == ${attr}"),
                    });
                    notes.push(format!("'{name}' pinned to context attribute '{attr}'"));
                    continue;
                }

                if LIMIT_HINTS.iter().any(|h| lower == *h) {
                    if let Some(n) = value.as_f64() {
                        constraints.push(Constraint::ValueBound {
                            field: name.clone(),
                            min: None,
                            max: Some(n),
                        });
                        notes.push(format!("'{name}' capped at {n}"));
                    }
                }
            }
        }

        let mut rationale = format!(
            "grant '{}' on {} only",
            schema.operation(),
            schema.name
        );
        if !notes.is_empty() {
            rationale.push_str("; ");
            rationale.push_str(&notes.join("; "));
        }

        Self {
            pattern: schema.name.clone(),
            operations: BTreeSet::from([schema.operation().to_string()]),
            constraints,
            rationale,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
