//! Compaction threshold policy
//!
//! A session needs compaction once its effective context reaches
//! `default_compression_threshold × max_input_tokens` of the target model.

use super::model_registry::ModelConfig;
use serde::{Deserialize, Serialize};

/// Token usage of a session's effective context against one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub context_tokens: usize,
    pub max_input_tokens: usize,
    pub threshold_tokens: usize,
    /// `context_tokens / max_input_tokens × 100`
    pub utilization_percentage: f64,
    /// Compression threshold as a percentage of the input window
    pub threshold_percentage: f64,
    /// Input tokens left before the hard limit, saturating at 0
    pub remaining_tokens: usize,
    pub needs_compaction: bool,
}

impl ContextUsage {
    pub fn evaluate(context_tokens: usize, config: &ModelConfig) -> Self {
        let threshold_tokens = config.threshold_tokens();
        let utilization_percentage = if config.max_input_tokens == 0 {
            0.0
        } else {
            context_tokens as f64 / config.max_input_tokens as f64 * 100.0
        };

        Self {
            context_tokens,
            max_input_tokens: config.max_input_tokens,
            threshold_tokens,
            utilization_percentage,
            threshold_percentage: config.default_compression_threshold * 100.0,
            remaining_tokens: config.max_input_tokens.saturating_sub(context_tokens),
            needs_compaction: needs_compaction(context_tokens, config),
        }
    }

    /// Tokens that can still be added before the threshold is reached
    pub fn headroom(&self) -> usize {
        self.threshold_tokens.saturating_sub(self.context_tokens)
    }
}

/// Whether `context_tokens` has reached the model's compaction threshold
pub fn needs_compaction(context_tokens: usize, config: &ModelConfig) -> bool {
    let threshold = config.threshold_tokens();
    threshold > 0 && context_tokens >= threshold
}
