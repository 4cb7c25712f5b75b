//! Ollama API provider.
//!
//! Calls `POST {host}/api/chat` with an Ollama-native request format.
//!
//! Differences from Anthropic:
//! - System prompt is sent as a `role: "system"` message (not a top-level field).
//! - Token usage: `prompt_eval_count` / `eval_count` (may be absent).
//! - Must set `stream: false` for synchronous responses.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::LlmClient;
use super::{LlmResponse, Message};
use crate::config::LlmConfig;

/// Default Ollama API base URL.
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

// ── Ollama API types ─────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: OllamaOptions,
}

/// Ollama generation options.
#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    /// Greedy decoding.
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

// ── OllamaClient ────────────────────────────────────────

/// Client for the Ollama API.
pub struct OllamaClient {
    client: Client,
    config: LlmConfig,
    host: String,
}

impl OllamaClient {
    /// Creates a new Ollama client from configuration.
    ///
    /// If `config.host` is `None`, defaults to `http://localhost:11434`.
    pub fn new(config: LlmConfig) -> Result<Self> {
        let host = config
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());
        // Strip trailing slash for consistent URL construction
        let host = host.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Cannot build Ollama HTTP client: {e}"))?;
        Ok(Self {
            client,
            config,
            host,
        })
    }

    fn build_request(&self, system_prompt: &str, messages: &[Message]) -> OllamaChatRequest {
        let mut ollama_messages = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            ollama_messages.push(Message {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        ollama_messages.extend_from_slice(messages);

        OllamaChatRequest {
            model: self.config.model.clone(),
            messages: ollama_messages,
            stream: false,
            options: OllamaOptions {
                num_predict: self.config.max_tokens_per_request,
                temperature: 0.0,
            },
        }
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse> {
        let request = self.build_request(system_prompt, messages);
        let url = format!("{}/api/chat", self.host);

        debug!(
            "Calling Ollama API ({}) with {} messages",
            self.config.model,
            messages.len()
        );

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({status}): {body}");
        }

        let resp: OllamaChatResponse = response.json().await?;
        if resp.done_reason.as_deref() == Some("length") {
            warn!("Ollama response truncated at {} tokens", self.config.max_tokens_per_request);
        }

        let input_tokens = resp.prompt_eval_count.unwrap_or(0);
        let output_tokens = resp.eval_count.unwrap_or(0);

        info!("LLM response: {input_tokens} in / {output_tokens} out tokens");

        Ok(LlmResponse {
            text: resp.message.content,
            input_tokens,
            output_tokens,
        })
    }

    fn description(&self) -> String {
        format!("{} ({})", self.config.provider, self.config.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider: "ollama".to_string(),
            model: "qwen2.5-coder".to_string(),
            api_key: String::new(),
            max_tokens_per_request: 4096,
            host: host.map(String::from),
            timeout_secs: 60,
        }
    }

    #[test]
    fn test_description() {
        let client = OllamaClient::new(config(None)).unwrap();
        assert_eq!(client.description(), "ollama (qwen2.5-coder)");
    }

    #[test]
    fn test_default_host() {
        let client = OllamaClient::new(config(None)).unwrap();
        assert_eq!(client.host, "http://localhost:11434");
    }

    #[test]
    fn test_custom_host() {
        let client = OllamaClient::new(config(Some("http://myserver:11434/"))).unwrap();
        // Trailing slash should be stripped
        assert_eq!(client.host, "http://myserver:11434");
    }

    // ── Request building ─────────────────────────────────

    #[test]
    fn test_system_prompt_becomes_first_message() {
        let client = OllamaClient::new(config(None)).unwrap();
        let request = client.build_request("write code", &[Message::user("list leads")]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "write code");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["options"]["num_predict"], 4096);
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        let client = OllamaClient::new(config(None)).unwrap();
        let request = client.build_request("", &[Message::user("hi")]);
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_response_parsing_without_counts() {
        let resp: OllamaChatResponse = serde_json::from_value(serde_json::json!({
            "message": {"role": "assistant", "content": "return 1;"},
            "done": true
        }))
        .unwrap();
        assert_eq!(resp.message.content, "return 1;");
        assert!(resp.prompt_eval_count.is_none());
    }
}
