pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::WardenError;

pub use registry::{InMemorySchemaSource, SchemaRegistry, SchemaSource, ToolCatalog};

/// Name segments that mark a tool as mutating when the schema does not
/// declare its operation explicitly.
const WRITE_SEGMENTS: &[&str] = &[
    "write", "update", "create", "delete", "send", "insert", "remove",
];

/// Declared type of a tool parameter or response field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl ParamType {
    /// Returns true if `value` inhabits this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }
}

/// Inclusive bounds: a numeric range for numbers, a length range for
/// strings and arrays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Bounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bounds {
    pub fn contains(&self, x: f64) -> bool {
        self.min.map_or(true, |m| x >= m) && self.max.map_or(true, |m| x <= m)
    }

    pub fn describe(&self) -> String {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
            (Some(lo), None) => format!(">= {lo}"),
            (None, Some(hi)) => format!("<= {hi}"),
            (None, None) => "unbounded".to_string(),
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One field of a tool's response object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: ParamType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseShape {
    #[serde(default)]
    pub fields: Vec<ResponseField>,
}

/// Schema of one external tool, as served by the schema collaborator.
///
/// Immutable once fetched. Versioning belongs to the registry; the
/// content fingerprint is what identifies a version here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Dotted, namespaced identifier, e.g. `salesforce.read.getLead`.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Operation tag checked against a token's permitted operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default)]
    pub response: ResponseShape,
}

impl ToolSchema {
    /// The declared operation, or one inferred from the name segments.
    pub fn operation(&self) -> &str {
        if let Some(op) = self.operation.as_deref() {
            return op;
        }
        // Matches `write`, `updateRecord`, `delete_file`; not `sendgrid`.
        let mutating = self.name.split('.').any(|segment| {
            WRITE_SEGMENTS.iter().any(|w| match segment.strip_prefix(w) {
                Some(rest) => rest
                    .chars()
                    .next()
                    .map_or(true, |c| c.is_ascii_uppercase() || c == '_'),
                None => false,
            })
        });
        if mutating {
            "write"
        } else {
            "read"
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.parameters.iter().filter(|p| p.required)
    }

    /// SHA-256 of the canonical JSON encoding, hex encoded.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Rejects schemas that cannot be enforced: empty or malformed
    /// names, duplicate parameters, patterns that do not compile.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.name.is_empty() || self.name.split('.').any(|s| s.is_empty() || s == "*") {
            return Err(WardenError::malformed(format!(
                "invalid tool name '{}'",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.parameters {
            if !seen.insert(p.name.as_str()) {
                return Err(WardenError::malformed(format!(
                    "tool '{}' declares parameter '{}' twice",
                    self.name, p.name
                )));
            }
            if let Some(ref pattern) = p.pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    WardenError::malformed(format!(
                        "tool '{}' parameter '{}' has invalid pattern: {e}",
                        self.name, p.name
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Short one-line signature used in model prompts and hints,
    /// e.g. `crm.read.getLead({recordId: string /^00Q/, fields?: array}) [read]`.
    pub fn signature(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|p| {
                let mut s = format!(
                    "{}{}: {}",
                    p.name,
                    if p.required { "" } else { "?" },
                    p.param_type.as_str()
                );
                if let Some(ref pattern) = p.pattern {
                    s.push_str(&format!(" /{pattern}/"));
                }
                if let Some(ref b) = p.bounds {
                    s.push_str(&format!(" {}", b.describe()));
                }
                s
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({{{params}}}) [{}]", self.name, self.operation())
    }
}
