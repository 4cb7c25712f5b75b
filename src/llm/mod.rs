//! LLM providers used by the code generator.

pub mod anthropic;
pub mod client;
pub mod ollama;

use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicClient;
pub use client::{build_client, LlmClient};
pub use ollama::OllamaClient;

/// One turn of a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// LLM response with metadata
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}
