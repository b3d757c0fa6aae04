//! Context accounting and compaction
//!
//! Token counting, per-model capacity limits, LLM summarization and the
//! compactor that ties them to a session store.

pub mod compactor;
pub mod model_registry;
pub mod models;
pub mod summarizer;
pub mod token_budget;
pub mod token_estimator;

pub use compactor::{CompactionOutcome, CompactionRequest, ContextCompactor, SkipReason};
pub use model_registry::{
    ModelConfig, ModelConfigUpdate, ModelDetector, ModelRegistry, NoDetection, Provenance, Provider,
};
pub use models::{Message, Part, Role, Snapshot, SnapshotContent, SnapshotKind, TokenCountResult, ToolStatus};
pub use summarizer::{
    GenerationRequest, OpenAiCompatibleGenerator, SummarizationOptions, SummarizationService,
    SummarizerError, TextGenerator,
};
pub use token_budget::ContextUsage;
pub use token_estimator::{TokenCounter, TokenEstimator, TokenizerError};
