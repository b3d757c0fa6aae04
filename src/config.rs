//! Configuration for the compaction core
//!
//! Values come from built-in defaults, an optional TOML file and
//! `COMPACTOR__SECTION__KEY` environment variables, in that order.

use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    #[serde(default)]
    pub summarizer: SummarizerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Config {
    /// Load configuration, reading `.env` first if present
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("COMPACTOR")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.tokenizer.chars_per_token == 0 {
            return Err(ContextError::Configuration(
                "tokenizer.chars_per_token must be positive".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.summarizer.temperature) {
            return Err(ContextError::Configuration(format!(
                "summarizer.temperature {} outside [0, 2]",
                self.summarizer.temperature
            )));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Tokenizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Divisor of the length-based fallback estimate
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

fn default_chars_per_token() -> usize {
    4
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// Summary generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Base URL of the OpenAI-compatible API when the caller gives none
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for providers without a dedicated summarization model
    #[serde(default = "default_summary_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base backoff in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_summary_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_summary_model(),
            temperature: default_temperature(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl SummarizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Model registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of resolved configs kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Seed the known-model table at startup
    #[serde(default = "default_seed")]
    pub seed_defaults: bool,
}

fn default_cache_capacity() -> u64 {
    256
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_seed() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
            seed_defaults: default_seed(),
        }
    }
}

impl RegistryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Compaction policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Global enable/disable for threshold-triggered compaction
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Fewest real messages worth folding into a summary
    #[serde(default = "default_min_eligible")]
    pub min_eligible_messages: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_min_eligible() -> usize {
    1
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_eligible_messages: default_min_eligible(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.tokenizer.chars_per_token, 4);
        assert_eq!(config.summarizer.default_model, "gpt-4o-mini");
        assert!((config.summarizer.temperature - 0.3).abs() < f32::EPSILON);
        assert!(config.registry.seed_defaults);
        assert!(config.compaction.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.tokenizer.chars_per_token = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.summarizer.temperature = 3.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_env() {
        let dir = std::env::temp_dir().join(format!("compactor-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("compactor.toml");
        std::fs::write(
            &path,
            r#"
                [summarizer]
                default_model = "gpt-4.1-mini"
                max_retries = 5

                [compaction]
                min_eligible_messages = 3
            "#,
        )
        .unwrap();

        std::env::set_var("COMPACTOR__REGISTRY__CACHE_CAPACITY", "32");
        let config = Config::load(path.to_str()).unwrap();
        std::env::remove_var("COMPACTOR__REGISTRY__CACHE_CAPACITY");

        assert_eq!(config.summarizer.default_model, "gpt-4.1-mini");
        assert_eq!(config.summarizer.max_retries, 5);
        assert_eq!(config.summarizer.timeout(), Duration::from_millis(60_000));
        assert_eq!(config.compaction.min_eligible_messages, 3);
        assert_eq!(config.registry.cache_capacity, 32);

        std::fs::remove_dir_all(dir).ok();
    }
}
