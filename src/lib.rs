//! Conversation context compaction for AI chat sessions
//!
//! Keeps a growing message history under a model's input-token budget:
//! - Precise token accounting with tiktoken (`o200k_base`)
//! - Per-model capacity limits and compression thresholds
//! - LLM-generated summaries persisted as snapshot checkpoints
//! - Context reconstruction from the latest snapshot plus the verbatim tail

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod store;

pub use context::{
    CompactionOutcome, CompactionRequest, ContextCompactor, ContextUsage, Message, ModelConfig,
    ModelRegistry, Part, Role, Snapshot, SummarizationOptions, SummarizationService, TokenCounter,
};
pub use error::{ContextError, Result};
pub use store::{ConfigStore, MemoryStore, SessionStore, StoreError};
