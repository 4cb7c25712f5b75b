//! Constraint model and compilation.
//!
//! Schemas and capability tokens both contribute constraints; the
//! compiler merges them into one ordered, immutable set per tool and
//! token combination, which the runtime guard evaluates on every call.

pub mod compiled;
pub mod compiler;
pub mod constraint;
pub mod predicate;
pub mod semantic;
pub mod suggest;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use compiled::{CheckEnv, CompiledConstraint, CompiledConstraintSet, Origin, Violation};
pub use compiler::ConstraintCompiler;
pub use constraint::{Constraint, Phase};
pub use predicate::Predicate;
pub use semantic::{DenyAllVerifier, HttpSemanticVerifier, SemanticVerifier, StaticVerifier};
pub use suggest::GrantSuggestion;

/// Who is running the task, and anything else predicates may refer to
/// as `$name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl PolicyContext {
    pub fn for_principal(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// `$principal` resolves to the principal; any other name to the
    /// attribute of that name. Unknown names are `null`.
    pub fn lookup(&self, name: &str) -> Value {
        if name == "principal" {
            return self
                .principal
                .as_ref()
                .map_or(Value::Null, |p| Value::String(p.clone()));
        }
        self.attributes.get(name).cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_lookup() {
        let ctx = PolicyContext::for_principal("user-1").with_attribute("region", json!("emea"));
        assert_eq!(ctx.lookup("principal"), json!("user-1"));
        assert_eq!(ctx.lookup("region"), json!("emea"));
        assert_eq!(ctx.lookup("missing"), Value::Null);
        assert_eq!(PolicyContext::default().lookup("principal"), Value::Null);
    }
}
