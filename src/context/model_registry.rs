//! Model capacity registry
//!
//! Resolves a `(provider, model)` pair to its capacity limits and compression
//! policy. Lookup never fails with "not found": unknown pairs go through the
//! pluggable detector and finally a conservative default, which is persisted
//! so the next lookup is a plain read.

use crate::config::RegistryConfig;
use crate::error::{ContextError, Result};
use crate::logging;
use crate::metrics::METRICS;
use crate::store::{ConfigStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

pub const FALLBACK_MAX_INPUT_TOKENS: usize = 8000;
pub const FALLBACK_MAX_OUTPUT_TOKENS: usize = 2000;
pub const FALLBACK_COMPRESSION_THRESHOLD: f64 = 0.90;
pub const FALLBACK_RETENTION_TOKENS: usize = 2000;

/// Model vendor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Azure,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Azure => "azure",
            Provider::Other(name) => name,
        }
    }
}

impl From<&str> for Provider {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Provider::OpenAi,
            "anthropic" => Provider::Anthropic,
            "google" => Provider::Google,
            "azure" => Provider::Azure,
            _ => Provider::Other(name.to_string()),
        }
    }
}

impl From<String> for Provider {
    fn from(name: String) -> Self {
        Provider::from(name.as_str())
    }
}

impl From<Provider> for String {
    fn from(provider: Provider) -> Self {
        provider.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a config entry was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Auto-detected from the provider
    Api,
    Manual,
    /// Built-in table or conservative fallback
    Default,
}

/// Capacity limits and compression policy of one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `provider:model`
    pub id: String,
    pub provider: Provider,
    pub model: String,
    pub max_input_tokens: usize,
    pub max_output_tokens: usize,
    /// Fraction of `max_input_tokens` that triggers compaction, in (0, 1]
    pub default_compression_threshold: f64,
    /// Tail kept verbatim when compacting
    pub recommended_retention_tokens: usize,
    pub source: Provenance,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ModelConfig {
    pub fn config_id(provider: &str, model: &str) -> String {
        format!("{}:{}", provider, model)
    }

    pub fn new(
        provider: impl Into<Provider>,
        model: impl Into<String>,
        max_input_tokens: usize,
        max_output_tokens: usize,
        default_compression_threshold: f64,
        recommended_retention_tokens: usize,
        source: Provenance,
    ) -> Self {
        let provider = provider.into();
        let model = model.into();
        let now = Utc::now();
        Self {
            id: Self::config_id(provider.as_str(), &model),
            provider,
            model,
            max_input_tokens,
            max_output_tokens,
            default_compression_threshold,
            recommended_retention_tokens,
            source,
            last_updated: now,
            created_at: now,
        }
    }

    /// Conservative limits for a model nothing is known about
    pub fn fallback(provider: &str, model: &str) -> Self {
        let mut config = Self::new(
            provider,
            model,
            FALLBACK_MAX_INPUT_TOKENS,
            FALLBACK_MAX_OUTPUT_TOKENS,
            FALLBACK_COMPRESSION_THRESHOLD,
            FALLBACK_RETENTION_TOKENS,
            Provenance::Default,
        );
        // keep the caller's spelling of the provider in the id
        config.id = Self::config_id(provider, model);
        config
    }

    /// Token count at which compaction should be triggered
    pub fn threshold_tokens(&self) -> usize {
        (self.default_compression_threshold * self.max_input_tokens as f64).floor() as usize
    }
}

/// Check that a compression threshold lies in (0, 1]
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(ContextError::InvalidConfig(format!(
            "compression threshold {} outside (0, 1]",
            threshold
        )))
    }
}

/// Partial update of a [`ModelConfig`]; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigUpdate {
    pub max_input_tokens: Option<usize>,
    pub max_output_tokens: Option<usize>,
    pub default_compression_threshold: Option<f64>,
    pub recommended_retention_tokens: Option<usize>,
    pub source: Option<Provenance>,
}

impl ModelConfigUpdate {
    /// Apply the provided fields and bump `last_updated` (never backwards)
    pub fn apply(&self, config: &mut ModelConfig, now: DateTime<Utc>) {
        if let Some(value) = self.max_input_tokens {
            config.max_input_tokens = value;
        }
        if let Some(value) = self.max_output_tokens {
            config.max_output_tokens = value;
        }
        if let Some(value) = self.default_compression_threshold {
            config.default_compression_threshold = value;
        }
        if let Some(value) = self.recommended_retention_tokens {
            config.recommended_retention_tokens = value;
        }
        if let Some(value) = self.source {
            config.source = value;
        }
        config.last_updated = now.max(config.last_updated);
    }
}

/// Provider-specific capacity detection
#[async_trait]
pub trait ModelDetector: Send + Sync {
    /// Look up limits for a model; `None` when the provider has no data
    async fn detect(&self, provider: &Provider, model: &str) -> Option<ModelConfig>;
}

/// Detector for deployments without provider metadata access
pub struct NoDetection;

#[async_trait]
impl ModelDetector for NoDetection {
    async fn detect(&self, provider: &Provider, model: &str) -> Option<ModelConfig> {
        debug!(provider = %provider, model, "Model detection not available");
        None
    }
}

// (provider, model, max input, max output, threshold, retention)
const DEFAULT_MODELS: &[(&str, &str, usize, usize, f64, usize)] = &[
    ("openai", "gpt-4o", 128_000, 16_384, 0.95, 8_000),
    ("openai", "gpt-4o-mini", 128_000, 16_384, 0.95, 8_000),
    ("openai", "gpt-4-turbo", 128_000, 4_096, 0.95, 8_000),
    ("openai", "gpt-3.5-turbo", 16_385, 4_096, 0.90, 4_000),
    ("anthropic", "claude-sonnet-4-5-20250929", 136_000, 8_192, 0.95, 10_000),
    ("anthropic", "claude-haiku-4-5-20250929", 136_000, 8_192, 0.95, 10_000),
    ("anthropic", "claude-3-5-sonnet-20241022", 200_000, 8_192, 0.95, 16_000),
    ("anthropic", "claude-3-7-sonnet-20250219", 200_000, 8_192, 0.95, 16_000),
    ("google", "gemini-2.0-flash-exp", 1_048_576, 8_192, 0.98, 20_000),
    ("google", "gemini-2.0-flash-thinking-exp", 1_048_576, 8_192, 0.98, 20_000),
    ("google", "gemini-exp-1206", 2_097_152, 8_192, 0.98, 20_000),
];

/// Built-in configs for well-known models
pub fn default_configs() -> Vec<ModelConfig> {
    DEFAULT_MODELS
        .iter()
        .map(|&(provider, model, max_in, max_out, threshold, retention)| {
            ModelConfig::new(provider, model, max_in, max_out, threshold, retention, Provenance::Default)
        })
        .collect()
}

/// Registry of model capacity configs
pub struct ModelRegistry {
    store: Arc<dyn ConfigStore>,
    detector: Arc<dyn ModelDetector>,
    cache: Cache<String, ModelConfig>,
    /// Bumped by every write to an id; a resolve only keeps what it cached
    /// if no write happened since its store read
    generations: DashMap<String, u64>,
    span: Span,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, config: &RegistryConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl())
            .build();

        Self {
            store,
            detector: Arc::new(NoDetection),
            cache,
            generations: DashMap::new(),
            span: logging::scope("compression:model-config"),
        }
    }

    /// Build a registry and seed the built-in table when configured to
    pub async fn initialize(store: Arc<dyn ConfigStore>, config: &RegistryConfig) -> Result<Self> {
        let registry = Self::new(store, config);
        if config.seed_defaults {
            registry.seed_defaults().await?;
        }
        Ok(registry)
    }

    pub fn with_detector(mut self, detector: Arc<dyn ModelDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Resolve the config for a model: stored, detected, or fallback
    pub async fn resolve(&self, provider: &str, model: &str) -> Result<ModelConfig> {
        self.resolve_inner(provider, model)
            .instrument(self.span.clone())
            .await
    }

    async fn resolve_inner(&self, provider: &str, model: &str) -> Result<ModelConfig> {
        let id = ModelConfig::config_id(provider, model);

        if let Some(config) = self.cache.get(&id).await {
            METRICS.record_config_resolution("stored");
            return Ok(config);
        }

        let generation = self.generation(&id);
        if let Some(config) = self.store.get_config(&id).await? {
            self.cache_if_current(id, config.clone(), generation).await;
            METRICS.record_config_resolution("stored");
            return Ok(config);
        }

        info!(config_id = %id, "Model config not found, attempting detection");
        if let Some(mut detected) = self.detector.detect(&Provider::from(provider), model).await {
            detected.id = id.clone();
            match validate_threshold(detected.default_compression_threshold) {
                Ok(()) => {
                    let saved = self.save(detected).await?;
                    METRICS.record_config_resolution("detected");
                    return Ok(saved);
                }
                Err(e) => warn!(config_id = %id, error = %e, "Ignoring detected config"),
            }
        }

        warn!(config_id = %id, "Could not detect config, using conservative defaults");
        let fallback = ModelConfig::fallback(provider, model);
        let fallback = match self.store.insert_config(fallback.clone()).await {
            Ok(()) => fallback,
            // saved concurrently; the stored row wins
            Err(StoreError::Conflict(_)) => match self.store.get_config(&id).await? {
                Some(stored) => stored,
                None => fallback,
            },
            Err(e) => return Err(e.into()),
        };
        self.cache_if_current(id, fallback.clone(), generation).await;
        METRICS.record_config_resolution("fallback");
        Ok(fallback)
    }

    fn generation(&self, id: &str) -> u64 {
        self.generations.get(id).map_or(0, |g| *g.value())
    }

    /// Record a committed write and drop the cached entry
    async fn written(&self, id: &str) {
        *self.generations.entry(id.to_string()).or_insert(0) += 1;
        self.cache.invalidate(id).await;
    }

    /// Cache a config read at `generation`, unless a write raced the read.
    ///
    /// Writers bump the generation before invalidating, so a write that
    /// landed before this insert is always seen by the re-check.
    async fn cache_if_current(&self, id: String, config: ModelConfig, generation: u64) {
        self.cache.insert(id.clone(), config).await;
        if self.generation(&id) != generation {
            debug!(config_id = %id, "Config changed during lookup, dropping cached copy");
            self.cache.invalidate(&id).await;
        }
    }

    /// Insert or replace a config, stamping `last_updated`
    pub async fn save(&self, mut config: ModelConfig) -> Result<ModelConfig> {
        validate_threshold(config.default_compression_threshold)?;
        config.last_updated = Utc::now();

        let saved = self.store.upsert_config(config).await?;
        self.written(&saved.id).await;
        self.span
            .in_scope(|| info!(config_id = %saved.id, "Saved model config"));
        Ok(saved)
    }

    /// Change only the provided fields of a stored config
    pub async fn update(&self, id: &str, update: ModelConfigUpdate) -> Result<ModelConfig> {
        if let Some(threshold) = update.default_compression_threshold {
            validate_threshold(threshold)?;
        }

        let updated = self.store.update_config(id, &update, Utc::now()).await?;
        self.written(id).await;
        self.span
            .in_scope(|| info!(config_id = %id, "Updated model config"));
        Ok(updated)
    }

    /// Remove a config; the next `resolve` recreates a fallback
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete_config(id).await?;
        self.written(id).await;
        self.span
            .in_scope(|| info!(config_id = %id, removed, "Deleted model config"));
        Ok(removed)
    }

    /// All stored configs
    pub async fn list(&self) -> Result<Vec<ModelConfig>> {
        Ok(self.store.list_configs().await?)
    }

    /// Insert the built-in configs that are not stored yet
    pub async fn seed_defaults(&self) -> Result<usize> {
        let mut inserted = 0;

        for config in default_configs() {
            if self.store.get_config(&config.id).await?.is_some() {
                continue;
            }
            let id = config.id.clone();
            match self.store.insert_config(config).await {
                Ok(()) => {
                    self.written(&id).await;
                    inserted += 1;
                }
                // written concurrently by someone else
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if inserted > 0 {
            self.span
                .in_scope(|| info!(count = inserted, "Seeded default model configurations"));
        }
        Ok(inserted)
    }
}
