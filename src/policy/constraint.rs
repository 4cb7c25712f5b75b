use serde::{Deserialize, Serialize};

use crate::schema::ParamType;

/// When a constraint runs relative to the forwarded tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Against the call's arguments, before anything is forwarded.
    #[default]
    Arguments,
    /// Against the back-end's response, before the script sees it.
    Response,
}

/// A predicate over a call's arguments or response.
///
/// All variants are pure and deterministic except `SemanticCheck`,
/// which defers to an external verifier and is bounded by a timeout.
/// Field names may be dotted paths into nested objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// A string field, when present, must match `regex`.
    FieldPattern { field: String, regex: String },
    /// The field must be present and non-null.
    FieldPresence {
        field: String,
        #[serde(default)]
        phase: Phase,
    },
    /// The field, when present, must have the given type.
    FieldType { field: String, expected: ParamType },
    /// A boolean expression over argument fields and `$context` values,
    /// e.g. `department == "Sales" && limit <= 50`.
    ScopeRestriction { predicate: String },
    /// Numeric range for numbers, length range for strings and arrays.
    ValueBound {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Response filter: the listed fields are redacted, never rejected on.
    FieldExclusion { fields: Vec<String> },
    /// Assertion delegated to a `SemanticVerifier` (e.g. "record exists").
    SemanticCheck {
        check: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default)]
        phase: Phase,
    },
}

impl Constraint {
    pub fn phase(&self) -> Phase {
        match self {
            Constraint::FieldExclusion { .. } => Phase::Response,
            Constraint::FieldPresence { phase, .. } | Constraint::SemanticCheck { phase, .. } => {
                *phase
            }
            _ => Phase::Arguments,
        }
    }

    /// The single field this constraint is about, if it is about one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Constraint::FieldPattern { field, .. }
            | Constraint::FieldPresence { field, .. }
            | Constraint::FieldType { field, .. }
            | Constraint::ValueBound { field, .. } => Some(field),
            Constraint::SemanticCheck { field, .. } => field.as_deref(),
            Constraint::ScopeRestriction { .. } | Constraint::FieldExclusion { .. } => None,
        }
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, Constraint::FieldExclusion { .. })
    }

    /// Compact, stable description used in traces and diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Constraint::FieldPattern { field, regex } => format!("field_pattern({field} ~ /{regex}/)"),
            Constraint::FieldPresence { field, phase } => match phase {
                Phase::Arguments => format!("field_presence({field})"),
                Phase::Response => format!("field_presence(response.{field})"),
            },
            Constraint::FieldType { field, expected } => {
                format!("field_type({field}: {})", expected.as_str())
            }
            Constraint::ScopeRestriction { predicate } => format!("scope_restriction({predicate})"),
            Constraint::ValueBound { field, min, max } => {
                let bounds = crate::schema::Bounds {
                    min: *min,
                    max: *max,
                };
                format!("value_bound({field} in {})", bounds.describe())
            }
            Constraint::FieldExclusion { fields } => {
                format!("field_exclusion({})", fields.join(", "))
            }
            Constraint::SemanticCheck { check, field, .. } => match field {
                Some(f) => format!("semantic_check({check} on {f})"),
                None => format!("semantic_check({check})"),
            },
        }
    }
}
