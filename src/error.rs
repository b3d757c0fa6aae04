//! Crate-level error type

use crate::context::summarizer::SummarizerError;
use crate::store::StoreError;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors surfaced by the context compaction core
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Summarization(#[from] SummarizerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid model config: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Compaction cancelled")]
    Cancelled,
}

impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}
