use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::Value;

use super::constraint::{Constraint, Phase};
use super::predicate::Predicate;
use super::semantic::SemanticVerifier;
use super::PolicyContext;
use crate::error::WardenError;
use crate::schema::Bounds;
use crate::script::value::{lookup_path, remove_path, type_name};

/// Where a compiled constraint came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Schema,
    Token(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Schema => f.write_str("schema"),
            Origin::Token(id) => write!(f, "token:{id}"),
        }
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Plain,
    Regex(Regex),
    Predicate(Predicate),
}

/// A constraint with its regex or predicate compiled once, up front.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledConstraint {
    #[serde(flatten)]
    pub constraint: Constraint,
    pub origin: Origin,
    #[serde(skip)]
    matcher: Matcher,
}

/// First failing constraint, before it is attributed to a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub constraint: String,
    pub field: Option<String>,
    pub reason: String,
    pub suggestion: Option<String>,
}

impl Violation {
    pub fn into_error(self, tool: &str) -> WardenError {
        WardenError::ConstraintViolation {
            tool: tool.to_string(),
            constraint: self.constraint,
            field: self.field,
            reason: self.reason,
            suggestion: self.suggestion,
        }
    }
}

/// Everything a check needs besides the value under test.
#[derive(Clone, Copy)]
pub struct CheckEnv<'a> {
    pub tool: &'a str,
    pub ctx: &'a PolicyContext,
    pub verifier: &'a dyn SemanticVerifier,
    pub semantic_timeout: Duration,
}

impl CompiledConstraint {
    pub fn new(constraint: Constraint, origin: Origin) -> Result<Self, WardenError> {
        let matcher = match &constraint {
            Constraint::FieldPattern { field, regex } => Matcher::Regex(
                Regex::new(regex).map_err(|e| {
                    WardenError::malformed(format!(
                        "{origin}: pattern for '{field}' does not compile: {e}"
                    ))
                })?,
            ),
            Constraint::ScopeRestriction { predicate } => {
                Matcher::Predicate(Predicate::compile(predicate).map_err(|e| match e {
                    WardenError::MalformedPolicy { detail } => {
                        WardenError::malformed(format!("{origin}: {detail}"))
                    }
                    other => other,
                })?)
            }
            Constraint::ValueBound { field, min, max } => {
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(WardenError::malformed(format!(
                            "{origin}: bound for '{field}' has min {lo} > max {hi}"
                        )));
                    }
                }
                Matcher::Plain
            }
            _ => Matcher::Plain,
        };
        Ok(Self {
            constraint,
            origin,
            matcher,
        })
    }

    pub fn phase(&self) -> Phase {
        self.constraint.phase()
    }

    pub fn is_filter(&self) -> bool {
        self.constraint.is_filter()
    }

    pub fn describe(&self) -> String {
        self.constraint.describe()
    }

    /// Evaluates this constraint against one arguments or response object.
    /// Filters always pass; they are applied by [`CompiledConstraint::apply_filter`].
    pub async fn check(&self, subject: &Value, env: &CheckEnv<'_>) -> Result<(), Violation> {
        let fail = |field: Option<&str>, reason: String, suggestion: Option<String>| Violation {
            constraint: self.describe(),
            field: field.map(str::to_string),
            reason,
            suggestion,
        };

        match (&self.constraint, &self.matcher) {
            (Constraint::FieldPattern { field, regex }, Matcher::Regex(re)) => {
                match present(subject, field) {
                    None => Ok(()),
                    Some(Value::String(s)) if re.is_match(s) => Ok(()),
                    Some(Value::String(s)) => Err(fail(
                        Some(field.as_str()),
                        format!("value '{s}' does not match /{regex}/"),
                        Some(format!("'{field}' must match /{regex}/")),
                    )),
                    Some(other) => Err(fail(
                        Some(field.as_str()),
                        format!("expected a string matching /{regex}/, got {}", type_name(other)),
                        Some(format!("'{field}' must be a string matching /{regex}/")),
                    )),
                }
            }
            (Constraint::FieldPresence { field, phase }, _) => match present(subject, field) {
                Some(_) => Ok(()),
                None if *phase == Phase::Response => Err(fail(
                    Some(field.as_str()),
                    format!("response is missing required field '{field}'"),
                    None,
                )),
                None => Err(fail(
                    Some(field.as_str()),
                    "required field is missing".into(),
                    Some(format!("add the required field '{field}'")),
                )),
            },
            (Constraint::FieldType { field, expected }, _) => match present(subject, field) {
                Some(v) if !expected.accepts(v) => Err(fail(
                    Some(field.as_str()),
                    format!("expected {}, got {}", expected.as_str(), type_name(v)),
                    Some(format!("'{field}' must be of type {}", expected.as_str())),
                )),
                _ => Ok(()),
            },
            (Constraint::ValueBound { field, min, max }, _) => {
                let bounds = Bounds {
                    min: *min,
                    max: *max,
                };
                let Some(v) = present(subject, field) else {
                    return Ok(());
                };
                let (measure, what) = match v {
                    Value::Number(_) => (v.as_f64().unwrap_or(f64::NAN), "value"),
                    Value::String(s) => (s.chars().count() as f64, "length"),
                    Value::Array(a) => (a.len() as f64, "length"),
                    other => {
                        return Err(fail(
                            Some(field.as_str()),
                            format!("cannot bound a value of type {}", type_name(other)),
                            None,
                        ))
                    }
                };
                if bounds.contains(measure) {
                    Ok(())
                } else {
                    Err(fail(
                        Some(field.as_str()),
                        format!("{what} {measure} is outside {}", bounds.describe()),
                        Some(format!("'{field}' {what} must be within {}", bounds.describe())),
                    ))
                }
            }
            (Constraint::ScopeRestriction { predicate }, Matcher::Predicate(p)) => {
                let field = p.fields().first().map(String::as_str);
                match p.evaluate(subject, env.ctx) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(fail(
                        field,
                        "scope restriction not satisfied".into(),
                        Some(format!("arguments must satisfy: {predicate}")),
                    )),
                    Err(e) => Err(fail(field, format!("predicate could not be evaluated: {e}"), None)),
                }
            }
            (Constraint::SemanticCheck { check, field, .. }, _) => {
                let target = match field {
                    Some(f) => lookup_path(subject, f).unwrap_or(&Value::Null),
                    None => subject,
                };
                let verdict = tokio::time::timeout(
                    env.semantic_timeout,
                    env.verifier.verify(check, env.tool, target, env.ctx),
                )
                .await;
                match verdict {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(fail(
                        field.as_deref(),
                        format!("semantic check '{check}' failed"),
                        None,
                    )),
                    Ok(Err(e)) => Err(fail(
                        field.as_deref(),
                        format!("semantic check '{check}' could not be verified: {e}"),
                        None,
                    )),
                    Err(_) => Err(fail(
                        field.as_deref(),
                        format!(
                            "semantic check '{check}' timed out after {}ms",
                            env.semantic_timeout.as_millis()
                        ),
                        None,
                    )),
                }
            }
            (Constraint::FieldExclusion { .. }, _) => Ok(()),
            // A constraint always gets the matcher its variant needs in `new`.
            (c, _) => Err(fail(c.field(), "constraint was not compiled".into(), None)),
        }
    }

    /// Redacts excluded fields. Returns how many values were removed.
    pub fn apply_filter(&self, response: &mut Value) -> usize {
        match &self.constraint {
            Constraint::FieldExclusion { fields } => {
                fields.iter().map(|f| remove_path(response, f)).sum()
            }
            _ => 0,
        }
    }
}

/// Present and non-null.
fn present<'a>(subject: &'a Value, field: &str) -> Option<&'a Value> {
    lookup_path(subject, field).filter(|v| !v.is_null())
}

/// Constraints for one (schema, token set) pair, in evaluation order.
#[derive(Debug, Serialize)]
pub struct CompiledConstraintSet {
    pub tool: String,
    pub fingerprint: String,
    pub operation: String,
    /// Ids of the tokens that contributed, in supplied order.
    pub tokens: Vec<String>,
    /// Checked against arguments before dispatch.
    pub pre: Vec<CompiledConstraint>,
    /// Assertions and filters applied to the response.
    pub post: Vec<CompiledConstraint>,
}

impl CompiledConstraintSet {
    /// Evaluates `pre` in order and stops at the first failure.
    pub async fn check_arguments(&self, args: &Value, env: &CheckEnv<'_>) -> Result<(), WardenError> {
        for c in &self.pre {
            c.check(args, env)
                .await
                .map_err(|v| v.into_error(&self.tool))?;
        }
        Ok(())
    }

    /// Runs response assertions on the raw response, then applies the
    /// filters and returns the redacted response. A list response is
    /// checked element by element.
    pub async fn check_response(&self, mut response: Value, env: &CheckEnv<'_>) -> Result<Value, WardenError> {
        for c in self.post.iter().filter(|c| !c.is_filter()) {
            match &response {
                Value::Array(items) => {
                    for item in items {
                        c.check(item, env).await.map_err(|v| v.into_error(&self.tool))?;
                    }
                }
                single => c.check(single, env).await.map_err(|v| v.into_error(&self.tool))?,
            }
        }
        for c in self.post.iter().filter(|c| c.is_filter()) {
            c.apply_filter(&mut response);
        }
        Ok(response)
    }

    /// Descriptions of every constraint, pre then post; recorded in the trace.
    pub fn descriptions(&self) -> Vec<String> {
        self.pre
            .iter()
            .chain(self.post.iter())
            .map(|c| c.describe())
            .collect()
    }

    /// The first pre-phase constraint about `field`, for diagnostics.
    pub fn constraint_for(&self, field: &str) -> Option<&CompiledConstraint> {
        self.pre.iter().find(|c| c.constraint.field() == Some(field))
    }
}
