//! Configuration loading from mcp-client.toml.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use runtime::{
    ANTHROPIC_API_URL, AnthropicBackend, ConnectOptions, DEFAULT_MAX_TOKENS, DEFAULT_MAX_TURNS,
    DEFAULT_MODEL, EngineOptions,
};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "mcp-client.toml";
const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,

    #[serde(default)]
    pub server: ServerSection,
}

/// Inference backend configuration.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Falls back to `ANTHROPIC_API_KEY` when unset.
    pub api_key: Option<String>,
    pub base_url: String,
    pub system: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            api_key: None,
            base_url: ANTHROPIC_API_URL.to_string(),
            system: None,
        }
    }
}

/// Limits for the conversation loop.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversationConfig {
    pub max_turns: usize,
    pub tool_timeout_secs: u64,
    pub inference_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            tool_timeout_secs: 30,
            inference_timeout_secs: 120,
        }
    }
}

/// Extra settings for the tool server process.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub env: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.conversation.max_turns == 0 {
            return Err(ConfigError::Invalid(
                "conversation.max_turns must be at least 1".into(),
            ));
        }
        if self.backend.model.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.model must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve the API key, preferring the config file over the environment.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        self.resolve_api_key(std::env::var(API_KEY_VAR).ok())
    }

    fn resolve_api_key(&self, from_env: Option<String>) -> Result<String, ConfigError> {
        self.backend
            .api_key
            .clone()
            .or(from_env)
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    pub fn backend(&self) -> Result<AnthropicBackend, ConfigError> {
        let mut builder = AnthropicBackend::builder(self.api_key()?, &self.backend.model)
            .max_tokens(self.backend.max_tokens)
            .base_url(&self.backend.base_url);
        if let Some(system) = &self.backend.system {
            builder = builder.system(system);
        }
        Ok(builder.build())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let conversation = &self.conversation;
        ConnectOptions {
            engine: EngineOptions {
                max_turns: conversation.max_turns,
                inference_timeout: Some(Duration::from_secs(conversation.inference_timeout_secs)),
                tool_timeout: Some(Duration::from_secs(conversation.tool_timeout_secs)),
            },
            ..ConnectOptions::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("API key not configured: set backend.api_key or ANTHROPIC_API_KEY")]
    MissingApiKey,
}
