//! Tool back-ends: where a call goes once the guard has let it through.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// Maximum response body accepted from a tool back-end (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

const USER_AGENT: &str = "FluuxWarden/0.1 (+https://github.com/processone/fluux-warden)";

/// Uniform call interface to the external tools.
///
/// Only the runtime guard holds a back-end; generated code never sees one.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn invoke(&self, tool: &str, args: &Value) -> anyhow::Result<Value>;
}

/// POSTs JSON arguments to `{base_url}/tools/{name}` and expects a JSON
/// response body.
pub struct HttpToolBackend {
    client: reqwest::Client,
    base_url: url::Url,
    auth_token: Option<String>,
}

impl HttpToolBackend {
    pub fn new(base_url: &str, timeout: Duration, auth_token: Option<String>) -> anyhow::Result<Self> {
        let mut base_url = url::Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid tool back-end URL '{base_url}': {e}"))?;
        match base_url.scheme() {
            "http" | "https" => {}
            scheme => anyhow::bail!("Unsupported tool back-end scheme '{scheme}' (only http/https)"),
        }
        // `join` replaces the last segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow::anyhow!("Cannot build tool back-end HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    pub fn endpoint(&self, tool: &str) -> anyhow::Result<url::Url> {
        if tool.is_empty() || tool.contains('/') {
            anyhow::bail!("Invalid tool name '{tool}'");
        }
        self.base_url
            .join(&format!("tools/{tool}"))
            .map_err(|e| anyhow::anyhow!("Cannot build endpoint for '{tool}': {e}"))
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    async fn invoke(&self, tool: &str, args: &Value) -> anyhow::Result<Value> {
        let url = self.endpoint(tool)?;
        debug!("Invoking {tool} at {url}");

        let mut request = self.client.post(url).json(args);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| {
            warn!("Tool back-end request for {tool} failed: {e}");
            anyhow::anyhow!("request failed: {e}")
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            anyhow::bail!("HTTP {status}: {snippet}");
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_SIZE {
                anyhow::bail!(
                    "response too large ({len} bytes, limit is {MAX_RESPONSE_SIZE} bytes)"
                );
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("error reading response: {e}"))?;
        if body.len() > MAX_RESPONSE_SIZE {
            anyhow::bail!(
                "response too large ({} bytes, limit is {MAX_RESPONSE_SIZE} bytes)",
                body.len()
            );
        }
        serde_json::from_slice(&body).map_err(|e| anyhow::anyhow!("response is not JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_endpoint() {
        let backend =
            HttpToolBackend::new("http://localhost:8080/api", Duration::from_secs(5), None).unwrap();
        assert_eq!(
            backend.endpoint("salesforce.read.getLead").unwrap().as_str(),
            "http://localhost:8080/api/tools/salesforce.read.getLead"
        );
        assert!(backend.endpoint("../admin").is_err());
        assert!(backend.endpoint("").is_err());
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpToolBackend::new("ftp://tools", Duration::from_secs(5), None).is_err());
        assert!(HttpToolBackend::new("not a url", Duration::from_secs(5), None).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_an_error() {
        // Port 9 (discard) is almost never served locally.
        let backend =
            HttpToolBackend::new("http://127.0.0.1:9", Duration::from_millis(500), None).unwrap();
        assert!(backend.invoke("a.b", &serde_json::json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_configured_timeout_applies() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let backend =
            HttpToolBackend::new(&format!("http://{addr}"), Duration::from_millis(200), None).unwrap();
        let started = std::time::Instant::now();
        let result = backend.invoke("a.b", &serde_json::json!({})).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[test]
    fn test_backend_is_object_safe() {
        fn _assert(_: Arc<dyn ToolBackend>) {}
    }
}
