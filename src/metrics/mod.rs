//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Histogram, Opts, Registry,
};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Compaction metrics
    pub compactions: CounterVec,
    pub summarization_duration: Histogram,
    pub summarization_failures: Counter,

    // Token accounting metrics
    pub context_tokens: Histogram,
    pub tokenizer_fallbacks: Counter,

    // Model registry metrics
    pub config_resolutions: CounterVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let compactions = register_counter_vec_with_registry!(
            Opts::new("compactions_total", "Compaction attempts by outcome"),
            &["outcome"],
            registry
        )?;

        let summarization_duration = register_histogram_with_registry!(
            "summarization_duration_seconds",
            "Summary generation duration in seconds",
            registry
        )?;

        let summarization_failures = register_counter_with_registry!(
            Opts::new("summarization_failures_total", "Total failed summary generations"),
            registry
        )?;

        let context_tokens = register_histogram_with_registry!(
            "context_tokens",
            "Tokens in evaluated session contexts",
            registry
        )?;

        let tokenizer_fallbacks = register_counter_with_registry!(
            Opts::new("tokenizer_fallbacks_total", "Texts counted with the length-based estimate"),
            registry
        )?;

        let config_resolutions = register_counter_vec_with_registry!(
            Opts::new("model_config_resolutions_total", "Model config lookups by source"),
            &["source"],
            registry
        )?;

        Ok(Self {
            registry,
            compactions,
            summarization_duration,
            summarization_failures,
            context_tokens,
            tokenizer_fallbacks,
            config_resolutions,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a compaction attempt
    pub fn record_compaction(&self, outcome: &str) {
        self.compactions.with_label_values(&[outcome]).inc();
    }

    /// Record a summary generation
    pub fn record_summarization(&self, success: bool, duration_secs: f64) {
        self.summarization_duration.observe(duration_secs);
        if !success {
            self.summarization_failures.inc();
        }
    }

    pub fn record_context_tokens(&self, tokens: usize) {
        self.context_tokens.observe(tokens as f64);
    }

    pub fn record_tokenizer_fallback(&self) {
        self.tokenizer_fallbacks.inc();
    }

    /// Record where a model config came from (`stored`, `detected`, `fallback`)
    pub fn record_config_resolution(&self, source: &str) {
        self.config_resolutions.with_label_values(&[source]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}
