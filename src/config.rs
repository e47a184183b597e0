//! Application configuration
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`doculens.toml` in the working directory unless a path is given)
//! 3. `DOCULENS_<SECTION>__<KEY>` environment variables
//! 4. provider variables (`OPENAI_API_KEY`, `OPENAI_API_BASE`, `ANTHROPIC_API_KEY`,
//!    `ANTHROPIC_BASE_URL`) for settings still unset
//!
//! A `.env` file is loaded into the environment first. Configuration is read
//! once at startup and handed to components as plain values.

use serde::Deserialize;
use std::path::Path;

use crate::logging::LoggingConfig;
use crate::query::Backend;
use crate::retrieval::RetrievalConfig;
use crate::vision::{AnthropicConfig, ChatOptions, ImageDetail, OpenAiConfig};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub openai: OpenAiConfig,

    #[serde(default)]
    pub anthropic: AnthropicConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults for document queries
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default)]
    pub detail: ImageDetail,

    /// Backend used when a query names none
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_query")]
    pub default_query: String,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_query() -> String {
    "Tell me what the BLEU score for the transformer base model is.".to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            detail: ImageDetail::default(),
            backend: Backend::default(),
            default_query: default_query(),
        }
    }
}

impl GenerationConfig {
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions::default()
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
            .with_detail(self.detail)
    }
}

impl AppConfig {
    /// Load configuration from all sources
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(path) => ::config::File::from(path).required(true),
            None => ::config::File::with_name("doculens").required(false),
        };

        let config: AppConfig = ::config::Config::builder()
            .add_source(file)
            .add_source(
                ::config::Environment::with_prefix("DOCULENS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        let config = config.from_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without consulting the environment
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Apply provider environment variables
    pub fn from_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.openai = self.openai.apply_env(&lookup);
        self.anthropic = self.anthropic.apply_env(&lookup);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.max_tokens == 0 {
            return Err(ConfigError::Invalid(
                "generation.max_tokens must be positive".to_string(),
            ));
        }

        let temperature = self.generation.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::Invalid(format!(
                "generation.temperature must be between 0.0 and 2.0, got {}",
                temperature
            )));
        }

        if self.retrieval.service_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "retrieval.service_url is required".to_string(),
            ));
        }

        Ok(())
    }
}
