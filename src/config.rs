use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::ResourceBudget;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub registry: RegistryConfig,
    pub backend: BackendConfig,
    pub trust: TrustConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    /// Remote judge for `semantic_check` constraints; without one every
    /// semantic check fails
    #[serde(default)]
    pub verifier: Option<VerifierConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// "anthropic" or "ollama"
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
    /// Ollama base URL, defaults to http://localhost:11434
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// JSON file holding the tool schemas of the session catalog
    pub schemas: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Tools are invoked at `{base_url}/tools/{name}`
    pub base_url: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    /// Bearer token sent to the back-end. Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrustConfig {
    /// Issuer key id → base64 Ed25519 public key
    pub issuers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    /// Checks are POSTed to `{url}/checks/{name}`
    pub url: String,
    /// Bearer token sent to the verifier. Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SandboxConfig {
    #[serde(default = "default_wall_clock_ms")]
    pub wall_clock_ms: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_semantic_timeout_ms")]
    pub semantic_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RepairConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_wall_clock_ms() -> u64 {
    30_000
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_tool_calls() -> u64 {
    50
}

fn default_grace_period_ms() -> u64 {
    500
}

fn default_semantic_timeout_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_generation_timeout() -> u64 {
    60
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            wall_clock_ms: default_wall_clock_ms(),
            max_memory_bytes: default_max_memory_bytes(),
            max_tool_calls: default_max_tool_calls(),
            grace_period_ms: default_grace_period_ms(),
            semantic_timeout_ms: default_semantic_timeout_ms(),
        }
    }
}

impl SandboxConfig {
    pub fn budget(&self) -> ResourceBudget {
        ResourceBudget {
            wall_clock: Duration::from_millis(self.wall_clock_ms),
            max_memory_bytes: self.max_memory_bytes,
            max_tool_calls: self.max_tool_calls,
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }

    pub fn semantic_timeout(&self) -> Duration {
        Duration::from_millis(self.semantic_timeout_ms)
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            generation_timeout_secs: default_generation_timeout(),
        }
    }
}

impl RepairConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ANTHROPIC_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.repair.max_attempts == 0 {
            anyhow::bail!("[repair] max_attempts must be at least 1");
        }
        if self.sandbox.wall_clock_ms == 0 {
            anyhow::bail!("[sandbox] wall_clock_ms must be positive");
        }
        if self.trust.issuers.is_empty() {
            anyhow::bail!("[trust] issuers is empty: no token could ever verify");
        }
        Ok(())
    }
}
