//! `LlmClient` trait: abstraction over LLM backends.
//!
//! Providers (Anthropic, Ollama) implement this trait so the code
//! generator can be pointed at any supported backend via the
//! `[llm] provider` config field.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{AnthropicClient, LlmResponse, Message, OllamaClient};
use crate::config::LlmConfig;

/// Abstraction over LLM backends.
///
/// Each provider translates the shared message type into its own wire
/// format and normalizes responses back into [`LlmResponse`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends a conversation to the LLM and returns the text it produced.
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> Result<LlmResponse>;

    /// Human-readable description of the provider and model.
    ///
    /// Used in log output, e.g. `"anthropic (claude-sonnet-4-5-20250929)"`.
    fn description(&self) -> String;
}

/// Builds the client selected by `config.provider`.
///
/// Unknown providers are a configuration error, reported at startup.
pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "anthropic" => {
            if config.api_key.is_empty() {
                anyhow::bail!("[llm] api_key is required for the anthropic provider");
            }
            Ok(Arc::new(AnthropicClient::new(config.clone())?))
        }
        "ollama" => Ok(Arc::new(OllamaClient::new(config.clone())?)),
        other => anyhow::bail!(
            "Unsupported LLM provider: '{other}'. Supported: 'anthropic', 'ollama'."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, api_key: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: "test-model".to_string(),
            api_key: api_key.to_string(),
            max_tokens_per_request: 2048,
            host: None,
            timeout_secs: 60,
        }
    }

    /// Compile-time verification that `LlmClient` is object-safe.
    #[test]
    fn test_llm_client_is_object_safe() {
        fn _assert_object_safe(_: &dyn LlmClient) {}
    }

    #[test]
    fn test_build_client_by_provider() {
        let client = build_client(&config("anthropic", "key")).unwrap();
        assert_eq!(client.description(), "anthropic (test-model)");

        let client = build_client(&config("ollama", "")).unwrap();
        assert_eq!(client.description(), "ollama (test-model)");
    }

    #[test]
    fn test_build_client_rejects_unknown_provider() {
        let err = build_client(&config("gpt-in-a-box", "")).err().unwrap();
        assert!(err.to_string().contains("gpt-in-a-box"));
    }

    #[test]
    fn test_anthropic_requires_api_key() {
        assert!(build_client(&config("anthropic", "")).is_err());
    }
}
