use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WardenError;
use crate::policy::Constraint;

/// Which tool names a token covers.
///
/// Either an exact dotted name (`salesforce.read.getLead`) or a trailing
/// namespace wildcard (`salesforce.read.*`) that matches every name with
/// at least one more segment under that namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolPattern {
    segments: Vec<String>,
    wildcard: bool,
}

impl ToolPattern {
    pub fn parse(pattern: &str) -> Result<Self, WardenError> {
        let bad = |reason: &str| {
            WardenError::malformed(format!("tool pattern '{pattern}': {reason}"))
        };

        let mut segments: Vec<String> = pattern.split('.').map(str::to_string).collect();
        let wildcard = segments.last().is_some_and(|s| s == "*");
        if wildcard {
            segments.pop();
            if segments.is_empty() {
                return Err(bad("a bare '*' matches everything and is not allowed"));
            }
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(bad("empty segment"));
            }
            if segment.contains('*') {
                return Err(bad("wildcards are only allowed as the last segment"));
            }
        }
        Ok(Self { segments, wildcard })
    }

    pub fn exact(name: &str) -> Result<Self, WardenError> {
        let pattern = Self::parse(name)?;
        if pattern.wildcard {
            return Err(WardenError::malformed(format!(
                "'{name}' is not an exact tool name"
            )));
        }
        Ok(pattern)
    }

    pub fn matches(&self, tool: &str) -> bool {
        let mut parts = tool.split('.');
        for segment in &self.segments {
            match parts.next() {
                Some(part) if part == segment => {}
                _ => return false,
            }
        }
        match parts.next() {
            None => !self.wildcard,
            Some(part) => self.wildcard && !part.is_empty() && parts.all(|p| !p.is_empty()),
        }
    }

    /// First namespace segment; every valid pattern has one.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

impl fmt::Display for ToolPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))?;
        if self.wildcard {
            f.write_str(".*")?;
        }
        Ok(())
    }
}

impl FromStr for ToolPattern {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ToolPattern {
    type Error = WardenError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ToolPattern> for String {
    fn from(p: ToolPattern) -> Self {
        p.to_string()
    }
}

/// A signed, self-contained grant to call tools matching `pattern`.
///
/// Tokens are supplied by the caller per request and only ever read.
/// The signature covers every other field; see [`CapabilityToken::signing_bytes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub id: String,
    pub pattern: ToolPattern,
    pub operations: BTreeSet<String>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Key id of the issuing authority, resolved through the trust store.
    pub issuer: String,
    pub expires_at: DateTime<Utc>,
    /// Base64 Ed25519 signature.
    pub signature: String,
}

/// The signed portion of a token, in a fixed field order.
#[derive(Serialize)]
struct SignedClaims<'a> {
    id: &'a str,
    pattern: &'a ToolPattern,
    operations: &'a BTreeSet<String>,
    constraints: &'a [Constraint],
    issuer: &'a str,
    expires_at: &'a DateTime<Utc>,
}

impl CapabilityToken {
    /// Canonical bytes the issuer signs: compact JSON of all fields
    /// except the signature. Operations are a sorted set, so the
    /// encoding does not depend on the order they were supplied in.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let claims = SignedClaims {
            id: &self.id,
            pattern: &self.pattern,
            operations: &self.operations,
            constraints: &self.constraints,
            issuer: &self.issuer,
            expires_at: &self.expires_at,
        };
        serde_json::to_vec(&claims).unwrap_or_default()
    }

    pub fn permits(&self, operation: &str) -> bool {
        self.operations.contains(operation)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Load a JSON array of tokens from a file.
    pub fn load_all(path: &std::path::Path) -> anyhow::Result<Vec<CapabilityToken>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read tokens {}: {e}", path.display()))?;
        let tokens: Vec<CapabilityToken> = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse tokens {}: {e}", path.display()))?;
        Ok(tokens)
    }
}
