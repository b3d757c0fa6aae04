//! Token counting using tiktoken
//!
//! Raw text is encoded with `o200k_base`. Structural overhead for messages,
//! tool calls, tool results and attachments is added on top of the raw
//! counts. When the encoder cannot process a string (or has been released)
//! the count degrades to a `ceil(chars / 4)` estimate instead of failing.

use super::models::{Message, Part, TokenCountResult};
use crate::config::TokenizerConfig;
use crate::logging;
use crate::metrics::METRICS;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::{o200k_base, CoreBPE};
use tracing::{debug, warn, Span};

/// Role and formatting cost of every message
pub const MESSAGE_OVERHEAD: usize = 4;
pub const TOOL_INVOCATION_OVERHEAD: usize = 3;
pub const TOOL_RESULT_OVERHEAD: usize = 3;
pub const ATTACHMENT_OVERHEAD: usize = 2;

/// Upper bound for the estimated response size of a conversation
pub const MAX_ESTIMATED_RESPONSE_TOKENS: usize = 2000;

/// Tokenizer errors. Never surfaced by [`TokenCounter`].
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("Failed to load encoding: {0}")]
    Initialization(String),

    #[error("Encoder has been released")]
    Released,

    #[error("Failed to encode text of {length} bytes")]
    Encoding { length: usize },
}

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }

    /// Exact count, reporting failure instead of degrading
    fn try_estimate(&self, text: &str) -> Result<usize, TokenizerError> {
        Ok(self.estimate(text))
    }

    /// Free held resources. Returns whether anything was released.
    fn release(&mut self) -> bool {
        false
    }

    fn is_released(&self) -> bool {
        false
    }
}

/// Tiktoken-based estimator using o200k_base (GPT-4o family)
pub struct TiktokenEstimator {
    bpe: Option<Arc<CoreBPE>>,
}

impl TiktokenEstimator {
    /// Load the o200k_base encoding
    pub fn new() -> Result<Self, TokenizerError> {
        let bpe = o200k_base().map_err(|e| TokenizerError::Initialization(e.to_string()))?;
        Ok(Self {
            bpe: Some(Arc::new(bpe)),
        })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.try_estimate(text)
            .unwrap_or_else(|_| CharRatioEstimator::default().estimate(text))
    }

    fn try_estimate(&self, text: &str) -> Result<usize, TokenizerError> {
        let bpe = self.bpe.as_ref().ok_or(TokenizerError::Released)?;
        panic::catch_unwind(AssertUnwindSafe(|| bpe.encode_with_special_tokens(text).len()))
            .map_err(|_| TokenizerError::Encoding { length: text.len() })
    }

    fn release(&mut self) -> bool {
        self.bpe.take().is_some()
    }

    fn is_released(&self) -> bool {
        self.bpe.is_none()
    }
}

/// Length-based estimator (fallback, ~4 characters per token)
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// Counts tokens for text, message parts, messages and whole conversations
pub struct TokenCounter {
    encoder: Box<dyn TokenEstimator>,
    fallback: CharRatioEstimator,
    span: Span,
}

impl TokenCounter {
    pub fn new(encoder: impl TokenEstimator + 'static, fallback: CharRatioEstimator) -> Self {
        let span = logging::scope("compression:token-counter");
        span.in_scope(|| debug!("TokenCounter initialized"));
        Self {
            encoder: Box::new(encoder),
            fallback,
            span,
        }
    }

    /// Counter with o200k_base and the default 4-chars-per-token fallback
    pub fn o200k() -> Result<Self, TokenizerError> {
        Ok(Self::new(TiktokenEstimator::new()?, CharRatioEstimator::default()))
    }

    pub fn from_config(config: &TokenizerConfig) -> Result<Self, TokenizerError> {
        Ok(Self::new(
            TiktokenEstimator::new()?,
            CharRatioEstimator::new(config.chars_per_token),
        ))
    }

    /// Replace the logging scope
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Count tokens in raw text
    pub fn count_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        match self.encoder.try_estimate(text) {
            Ok(tokens) => tokens,
            Err(TokenizerError::Released) => {
                self.span
                    .in_scope(|| debug!(text_length = text.len(), "Encoder released, estimating tokens"));
                self.fallback.estimate(text)
            }
            Err(e) => {
                self.span.in_scope(|| {
                    warn!(error = %e, text_length = text.len(), "Error encoding text, estimating tokens")
                });
                METRICS.record_tokenizer_fallback();
                self.fallback.estimate(text)
            }
        }
    }

    /// Count tokens in a single message part
    pub fn count_part(&self, part: &Part) -> usize {
        match part {
            Part::Text { content } => self.count_text(content),

            Part::ToolInvocation {
                tool_name,
                tool_call_id,
                input,
                input_text,
                status,
            } => {
                let mut tokens = self.count_text(tool_name) + self.count_text(tool_call_id);
                if !input.is_null() {
                    tokens += self.count_text(&input.to_string());
                }
                if let Some(text) = input_text {
                    tokens += self.count_text(text);
                }
                tokens + self.count_text(status.as_str()) + TOOL_INVOCATION_OVERHEAD
            }

            Part::ToolResult {
                related_tool_call_id,
                output,
                output_text,
                error_code,
                error_message,
            } => {
                let mut tokens = self.count_text(related_tool_call_id);
                if let Some(output) = output.as_ref().filter(|o| !o.is_null()) {
                    tokens += self.count_text(&output.to_string());
                }
                for text in [output_text, error_code, error_message].into_iter().flatten() {
                    tokens += self.count_text(text);
                }
                tokens + TOOL_RESULT_OVERHEAD
            }

            // Attachment bytes are never counted, only their description
            Part::Attachment {
                mime_type,
                size_bytes,
                metadata,
            } => {
                let mut tokens = self.count_text(mime_type);
                if let Some(size) = size_bytes {
                    tokens += self.count_text(&size.to_string());
                }
                if let Some(metadata) = metadata.as_ref().filter(|m| !m.is_null()) {
                    tokens += self.count_text(&metadata.to_string());
                }
                tokens + ATTACHMENT_OVERHEAD
            }

            Part::Metadata { .. } => 0,
        }
    }

    /// Count tokens in a message, including role and formatting overhead
    pub fn count_message(&self, message: &Message) -> usize {
        MESSAGE_OVERHEAD
            + self.count_text(message.role.as_str())
            + message.parts.iter().map(|p| self.count_part(p)).sum::<usize>()
    }

    /// Sum of [`count_message`](Self::count_message) over `messages`
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }

    /// Count a conversation, split into prompt-side and response-side tokens
    pub fn count_conversation(&self, messages: &[Message]) -> TokenCountResult {
        let mut input_tokens = 0;
        let mut output_tokens = 0;

        for message in messages {
            let tokens = self.count_message(message);
            if message.role.is_input() {
                input_tokens += tokens;
            } else {
                output_tokens += tokens;
            }
        }

        let total_tokens = input_tokens + output_tokens;

        TokenCountResult {
            total_tokens,
            input_tokens,
            output_tokens,
            estimated_response_tokens: (total_tokens / 10).min(MAX_ESTIMATED_RESPONSE_TOKENS),
        }
    }

    /// Free the encoder. Safe to call any number of times; later counts use
    /// the length-based estimate.
    pub fn release(&mut self) {
        if self.encoder.release() {
            self.span
                .in_scope(|| debug!("TokenCounter encoding resources freed"));
        }
    }

    pub fn is_released(&self) -> bool {
        self.encoder.is_released()
    }
}

impl Drop for TokenCounter {
    fn drop(&mut self) {
        self.release();
    }
}
