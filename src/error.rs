//! Error taxonomy shared by every stage of the pipeline.
//!
//! Each variant names the offending tool and/or field when one exists,
//! so the message alone is enough for an operator (or the repair
//! diagnostic) to locate the problem.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors produced while validating, executing, or repairing generated code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WardenError {
    /// The code references a tool that the session catalog does not contain.
    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },

    /// A statically determinable argument violates the tool schema.
    #[error("static schema violation in call to '{tool}' (field '{field}'): {reason}")]
    StaticSchemaViolation {
        tool: String,
        field: String,
        reason: String,
        line: usize,
    },

    #[error("capability token '{token}' has an invalid signature: {reason}")]
    InvalidSignature { token: String, reason: String },

    #[error("capability token '{token}' expired at {expired_at}")]
    Expired {
        token: String,
        expired_at: DateTime<Utc>,
    },

    /// No active token's pattern matches the tool (fail closed).
    #[error("no capability token matches tool '{tool}'")]
    NoMatchingCapability { tool: String },

    #[error("permission denied for tool '{tool}': {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("constraint violation in call to '{tool}' ({constraint}){}: {reason}", field_suffix(.field))]
    ConstraintViolation {
        tool: String,
        constraint: String,
        field: Option<String>,
        reason: String,
        suggestion: Option<String>,
    },

    /// Back-end failure. Not a security event.
    #[error("tool '{tool}' failed: {message}")]
    ToolError { tool: String, message: String },

    #[error("execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("resource exhausted: {resource} (limit {limit})")]
    ResourceExhausted { resource: String, limit: u64 },

    #[error("gave up after {attempts} repair attempt(s); last error: {last_error}")]
    MaxRepairAttemptsExceeded {
        attempts: u32,
        last_error: Box<WardenError>,
    },

    /// Syntax or runtime fault in the generated code itself.
    #[error("script error at line {line}: {message}")]
    ScriptError { line: usize, message: String },

    /// A schema or token carries a pattern/predicate that cannot be compiled.
    #[error("malformed policy: {detail}")]
    MalformedPolicy { detail: String },

    /// The code-generation collaborator failed or timed out.
    #[error("code generation failed: {message}")]
    GenerationFailed { message: String },
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" on field '{f}'"),
        None => String::new(),
    }
}

/// Flat discriminant of [`WardenError`], used in traces and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    StaticSchemaViolation,
    InvalidSignature,
    Expired,
    NoMatchingCapability,
    PermissionDenied,
    ConstraintViolation,
    ToolError,
    Timeout,
    ResourceExhausted,
    MaxRepairAttemptsExceeded,
    ScriptError,
    MalformedPolicy,
    GenerationFailed,
}

impl WardenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTool { .. } => ErrorKind::UnknownTool,
            Self::StaticSchemaViolation { .. } => ErrorKind::StaticSchemaViolation,
            Self::InvalidSignature { .. } => ErrorKind::InvalidSignature,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::NoMatchingCapability { .. } => ErrorKind::NoMatchingCapability,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Self::ToolError { .. } => ErrorKind::ToolError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::MaxRepairAttemptsExceeded { .. } => ErrorKind::MaxRepairAttemptsExceeded,
            Self::ScriptError { .. } => ErrorKind::ScriptError,
            Self::MalformedPolicy { .. } => ErrorKind::MalformedPolicy,
            Self::GenerationFailed { .. } => ErrorKind::GenerationFailed,
        }
    }

    /// Policy failures are never fixed by regenerating code: a missing
    /// grant stays missing whatever the model writes.
    pub fn is_policy_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PermissionDenied
                | ErrorKind::InvalidSignature
                | ErrorKind::Expired
                | ErrorKind::NoMatchingCapability
                | ErrorKind::MalformedPolicy
        )
    }

    /// Whether the self-repair loop may answer this error with new code.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnknownTool
                | ErrorKind::StaticSchemaViolation
                | ErrorKind::ConstraintViolation
                | ErrorKind::ScriptError
                | ErrorKind::ToolError
                | ErrorKind::Timeout
                | ErrorKind::ResourceExhausted
        )
    }

    /// The tool this error is about, if any.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::UnknownTool { tool }
            | Self::StaticSchemaViolation { tool, .. }
            | Self::NoMatchingCapability { tool }
            | Self::PermissionDenied { tool, .. }
            | Self::ConstraintViolation { tool, .. }
            | Self::ToolError { tool, .. } => Some(tool),
            _ => None,
        }
    }

    /// The argument field this error is about, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::StaticSchemaViolation { field, .. } => Some(field),
            Self::ConstraintViolation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn script(line: usize, message: impl Into<String>) -> Self {
        Self::ScriptError {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedPolicy {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_failures_are_not_repairable() {
        let errors = [
            WardenError::PermissionDenied {
                tool: "a.b".into(),
                reason: "no grant".into(),
            },
            WardenError::InvalidSignature {
                token: "t1".into(),
                reason: "bad".into(),
            },
            WardenError::Expired {
                token: "t1".into(),
                expired_at: Utc::now(),
            },
            WardenError::NoMatchingCapability { tool: "a.b".into() },
            WardenError::malformed("bad regex"),
        ];
        for e in errors {
            assert!(e.is_policy_failure(), "{e}");
            assert!(!e.is_repairable(), "{e}");
        }
    }

    #[test]
    fn test_code_quality_failures_are_repairable() {
        let errors = [
            WardenError::UnknownTool { tool: "x".into() },
            WardenError::Timeout { limit_ms: 2000 },
            WardenError::script(3, "unexpected token"),
            WardenError::ToolError {
                tool: "x".into(),
                message: "503".into(),
            },
        ];
        for e in errors {
            assert!(e.is_repairable(), "{e}");
            assert!(!e.is_policy_failure(), "{e}");
        }
    }

    #[test]
    fn test_max_attempts_is_terminal() {
        let e = WardenError::MaxRepairAttemptsExceeded {
            attempts: 3,
            last_error: Box::new(WardenError::Timeout { limit_ms: 10 }),
        };
        assert!(!e.is_repairable());
        assert!(!e.is_policy_failure());
        assert!(e.to_string().contains("3 repair attempt"));
    }

    #[test]
    fn test_constraint_violation_message_names_field() {
        let e = WardenError::ConstraintViolation {
            tool: "salesforce.read.getLead".into(),
            constraint: "field_pattern(recordId)".into(),
            field: Some("recordId".into()),
            reason: "does not match".into(),
            suggestion: None,
        };
        let msg = e.to_string();
        assert!(msg.contains("on field 'recordId'"));
        assert_eq!(e.field(), Some("recordId"));
        assert_eq!(e.tool(), Some("salesforce.read.getLead"));
    }
}
