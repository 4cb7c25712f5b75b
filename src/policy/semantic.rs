use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::PolicyContext;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 5;

const USER_AGENT: &str = "FluuxWarden/0.1 (+https://github.com/processone/fluux-warden)";

/// External judge for `semantic_check` constraints, e.g. "the record
/// this call refers to exists and belongs to the caller".
///
/// Implementations may be slow or remote; the guard bounds every call
/// with a timeout and treats a timeout or an `Err` as a failed check.
#[async_trait]
pub trait SemanticVerifier: Send + Sync {
    /// `subject` is the constrained field's value, or the whole
    /// arguments/response object when the constraint names no field.
    async fn verify(
        &self,
        check: &str,
        tool: &str,
        subject: &Value,
        ctx: &PolicyContext,
    ) -> anyhow::Result<bool>;
}

/// Used when no verifier is configured: every semantic check fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllVerifier;

#[async_trait]
impl SemanticVerifier for DenyAllVerifier {
    async fn verify(
        &self,
        check: &str,
        _tool: &str,
        _subject: &Value,
        _ctx: &PolicyContext,
    ) -> anyhow::Result<bool> {
        anyhow::bail!("no semantic verifier configured for check '{check}'")
    }
}

/// Fixed verdicts per check name. Unknown checks fail.
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    verdicts: HashMap<String, bool>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, check: impl Into<String>, verdict: bool) -> Self {
        self.verdicts.insert(check.into(), verdict);
        self
    }
}

#[async_trait]
impl SemanticVerifier for StaticVerifier {
    async fn verify(
        &self,
        check: &str,
        _tool: &str,
        _subject: &Value,
        _ctx: &PolicyContext,
    ) -> anyhow::Result<bool> {
        self.verdicts
            .get(check)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown semantic check '{check}'"))
    }
}

/// Body POSTed to a remote verifier.
#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    tool: &'a str,
    subject: &'a Value,
    context: &'a PolicyContext,
}

#[derive(Debug, Deserialize)]
struct CheckVerdict {
    allowed: bool,
}

/// Asks a remote service: POSTs `{tool, subject, context}` to
/// `{base_url}/checks/{check}` and expects `{"allowed": bool}` back.
/// Anything other than a 2xx with that body is an error, which the
/// guard turns into a failed check.
pub struct HttpSemanticVerifier {
    client: reqwest::Client,
    base_url: url::Url,
    auth_token: Option<String>,
}

impl HttpSemanticVerifier {
    pub fn new(base_url: &str, timeout: Duration, auth_token: Option<String>) -> anyhow::Result<Self> {
        let mut base_url = url::Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid verifier URL '{base_url}': {e}"))?;
        match base_url.scheme() {
            "http" | "https" => {}
            scheme => anyhow::bail!("Unsupported verifier scheme '{scheme}' (only http/https)"),
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow::anyhow!("Cannot build verifier HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    pub fn endpoint(&self, check: &str) -> anyhow::Result<url::Url> {
        if check.is_empty() || check.contains('/') {
            anyhow::bail!("Invalid semantic check name '{check}'");
        }
        self.base_url
            .join(&format!("checks/{check}"))
            .map_err(|e| anyhow::anyhow!("Cannot build endpoint for '{check}': {e}"))
    }
}

#[async_trait]
impl SemanticVerifier for HttpSemanticVerifier {
    async fn verify(
        &self,
        check: &str,
        tool: &str,
        subject: &Value,
        ctx: &PolicyContext,
    ) -> anyhow::Result<bool> {
        let url = self.endpoint(check)?;
        debug!("Semantic check {check} for {tool} at {url}");

        let mut request = self.client.post(url).json(&CheckRequest {
            tool,
            subject,
            context: ctx,
        });
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            warn!("Semantic check {check} request failed: {e}");
            anyhow::anyhow!("request failed: {e}")
        })?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("verifier returned HTTP {status} for check '{check}'");
        }
        let verdict: CheckVerdict = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("invalid verdict for check '{check}': {e}"))?;
        Ok(verdict.allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_deny_all() {
        let v = DenyAllVerifier;
        let r = v
            .verify("record_exists", "a.b", &json!("x"), &PolicyContext::default())
            .await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn test_static_verdicts() {
        let v = StaticVerifier::new()
            .with("record_exists", true)
            .with("is_owner", false);
        let ctx = PolicyContext::default();
        assert!(v.verify("record_exists", "a.b", &json!(1), &ctx).await.unwrap());
        assert!(!v.verify("is_owner", "a.b", &json!(1), &ctx).await.unwrap());
        assert!(v.verify("other", "a.b", &json!(1), &ctx).await.is_err());
    }

    #[test]
    fn test_http_verifier_endpoint() {
        let v = HttpSemanticVerifier::new("http://localhost:9100/policy", Duration::from_secs(1), None)
            .unwrap();
        assert_eq!(
            v.endpoint("record_exists").unwrap().as_str(),
            "http://localhost:9100/policy/checks/record_exists"
        );
        assert!(v.endpoint("../admin").is_err());
        assert!(v.endpoint("").is_err());
        assert!(HttpSemanticVerifier::new("file:///tmp", Duration::from_secs(1), None).is_err());
    }

    #[test]
    fn test_check_request_wire_format() {
        let ctx = PolicyContext::for_principal("005xx");
        let subject = json!("00Q1");
        let body = serde_json::to_value(CheckRequest {
            tool: "crm.read.getLead",
            subject: &subject,
            context: &ctx,
        })
        .unwrap();
        assert_eq!(body["tool"], "crm.read.getLead");
        assert_eq!(body["subject"], "00Q1");
        assert_eq!(body["context"]["principal"], "005xx");

        let verdict: CheckVerdict = serde_json::from_str(r#"{"allowed": true}"#).unwrap();
        assert!(verdict.allowed);
        assert!(serde_json::from_str::<CheckVerdict>("{}").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_http_verifier_is_an_error() {
        let v = HttpSemanticVerifier::new("http://127.0.0.1:9", Duration::from_millis(500), None)
            .unwrap();
        let r = v
            .verify("record_exists", "a.b", &json!("x"), &PolicyContext::default())
            .await;
        assert!(r.is_err());
    }

    #[test]
    fn test_verifier_is_object_safe() {
        fn _assert(_: Arc<dyn SemanticVerifier>) {}
    }
}
