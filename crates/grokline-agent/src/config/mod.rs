//! Session and generator configuration.
//!
//! - [`GeneratorConfig`] -- what the provider adapter needs to talk to xAI.
//!   The API key is read from the environment exactly once, here.
//! - [`SessionConfig`] -- per-session behaviour (turn ceiling, compression,
//!   checkpointing, sampling options), loadable from a TOML file.

pub mod auth;
pub mod models;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::types::GenerationConfig;

pub use auth::{AuthType, GROK_API_KEY_ENV, validate_auth_method};
pub use models::{DEFAULT_GROK_FLASH_MODEL, DEFAULT_GROK_MODEL, GROK_MODELS, token_limit};

/// Default xAI API base URL.
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

// ---------------------------------------------------------------------------
// Generator configuration
// ---------------------------------------------------------------------------

/// Connection settings for the content generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Default model id.
    pub model: String,
    /// xAI API key.
    pub api_key: String,
    /// API base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    /// The authentication method in use.
    pub auth_type: AuthType,
}

impl GeneratorConfig {
    /// Build a config from the process environment.
    pub fn from_env(model: Option<&str>, auth_type: AuthType) -> Result<Self> {
        Self::from_lookup(model, auth_type, |name| std::env::var(name).ok())
    }

    /// Build a config using `env` to look up environment variables.
    pub fn from_lookup<F>(model: Option<&str>, auth_type: AuthType, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if auth_type.is_legacy() {
            return Err(AgentError::Config {
                reason: AuthType::legacy_message().into(),
            });
        }

        let api_key = env(GROK_API_KEY_ENV)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AgentError::MissingApiKey {
                provider: "xai".into(),
            })?;

        let model = model
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_GROK_MODEL)
            .to_owned();

        Ok(Self {
            model,
            api_key,
            base_url: XAI_BASE_URL.into(),
            auth_type,
        })
    }

    /// Replace the base URL (OpenAI-compatible proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Per-session behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model id; empty means [`DEFAULT_GROK_MODEL`].
    pub model: String,
    /// Turn ceiling for the session; negative or absent means unlimited.
    pub max_session_turns: Option<i64>,
    /// Record recovery checkpoints before file-mutating tools run.
    pub checkpointing: bool,
    /// Directory for checkpoints and error reports.
    pub project_temp_dir: PathBuf,
    /// Maximum number of tool calls executing at once.
    pub max_tool_concurrency: usize,
    /// Fraction of the model token limit at which history is compressed.
    pub compression_threshold: f64,
    /// Fraction of the most recent history kept verbatim on compression.
    pub compression_preserve_fraction: f64,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub reasoning_effort: Option<String>,
    /// System instruction sent ahead of every request.
    pub system_instruction: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_GROK_MODEL.into(),
            max_session_turns: None,
            checkpointing: false,
            project_temp_dir: std::env::temp_dir().join("grokline"),
            max_tool_concurrency: 4,
            compression_threshold: 0.7,
            compression_preserve_fraction: 0.3,
            temperature: None,
            max_output_tokens: None,
            top_p: None,
            reasoning_effort: None,
            system_instruction: None,
        }
    }
}

impl SessionConfig {
    /// Load from a TOML file.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AgentError::Config {
            reason: format!("invalid session config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_tool_concurrency == 0 {
            return Err(AgentError::Config {
                reason: "max_tool_concurrency must be at least 1".into(),
            });
        }
        for (name, value) in [
            ("compression_threshold", self.compression_threshold),
            ("compression_preserve_fraction", self.compression_preserve_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentError::Config {
                    reason: format!("{name} must be between 0 and 1, got {value}"),
                });
            }
        }
        Ok(())
    }

    /// The effective model id.
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            DEFAULT_GROK_MODEL
        } else {
            &self.model
        }
    }

    /// The turn ceiling, if one is in force.
    pub fn turn_limit(&self) -> Option<u32> {
        self.max_session_turns
            .filter(|n| *n >= 0)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Sampling options for every generation call of the session.
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            top_p: self.top_p,
            reasoning_effort: self.reasoning_effort.clone(),
            ..GenerationConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
