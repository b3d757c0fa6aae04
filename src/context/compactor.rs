//! Session context compaction
//!
//! A session without snapshots uses its full message history as context. Once
//! compacted, the context is the latest summary (as a leading system message)
//! followed by every message after the snapshot's cutoff.
//!
//! Compactions of one session are serialized with a per-session lock; readers
//! of [`ContextCompactor::build_context`] never wait on it.

use super::model_registry::{ModelConfig, ModelRegistry};
use super::models::{Message, Snapshot, SnapshotKind};
use super::summarizer::{SummarizationOptions, SummarizationService, SummarizerError};
use super::token_budget::ContextUsage;
use super::token_estimator::TokenCounter;
use crate::config::CompactionConfig;
use crate::error::{ContextError, Result};
use crate::logging;
use crate::metrics::METRICS;
use crate::store::SessionStore;
use dashmap::DashMap;
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// Target model and summarization credentials of a compaction
#[derive(Debug)]
pub struct CompactionRequest {
    pub provider: String,
    pub model: String,
    pub api_key: SecretString,
    pub base_url: Option<String>,
    /// Overrides the provider's default summarization model
    pub summarization_model: Option<String>,
    pub prompt_template: Option<String>,
}

impl CompactionRequest {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            api_key,
            base_url: None,
            summarization_model: None,
            prompt_template: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_summarization_model(mut self, model: impl Into<String>) -> Self {
        self.summarization_model = Some(model.into());
        self
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }
}

/// Why a compaction did not write a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    BelowThreshold,
    /// Fewer messages outside the retained tail than the configured minimum
    NotEnoughMessages { eligible: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("compaction disabled"),
            SkipReason::BelowThreshold => f.write_str("context below compression threshold"),
            SkipReason::NotEnoughMessages { eligible } => {
                write!(f, "only {} message(s) eligible for compaction", eligible)
            }
        }
    }
}

/// Result of a compaction attempt
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    Compacted(Snapshot),
    Skipped(SkipReason),
}

impl CompactionOutcome {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            CompactionOutcome::Compacted(snapshot) => Some(snapshot),
            CompactionOutcome::Skipped(_) => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            CompactionOutcome::Compacted(_) => "compacted",
            CompactionOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Effective context of a session
struct EffectiveContext {
    messages: Vec<Message>,
    /// `messages[0]` is the rendered summary of the latest snapshot
    summarized: bool,
}

type SessionLocks = DashMap<String, Arc<Mutex<()>>>;

/// Exclusive hold on one session's compaction lock.
///
/// On drop the map entry is removed once nobody else holds or waits on it.
struct SessionLock<'a> {
    locks: &'a SessionLocks,
    session_id: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<'a> SessionLock<'a> {
    async fn acquire(locks: &'a SessionLocks, session_id: &'a str) -> SessionLock<'a> {
        let lock = locks.entry(session_id.to_string()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        Self {
            locks,
            session_id,
            guard: Some(guard),
        }
    }
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Builds session contexts and folds old history into summary snapshots
pub struct ContextCompactor {
    store: Arc<dyn SessionStore>,
    registry: Arc<ModelRegistry>,
    counter: Arc<TokenCounter>,
    summarizer: Arc<SummarizationService>,
    config: CompactionConfig,
    locks: SessionLocks,
    span: Span,
}

impl ContextCompactor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<ModelRegistry>,
        counter: Arc<TokenCounter>,
        summarizer: Arc<SummarizationService>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            store,
            registry,
            counter,
            summarizer,
            config,
            locks: DashMap::new(),
            span: logging::scope("compression:compactor"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Messages to send to the model for a session
    pub async fn build_context(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .effective_context(session_id)
            .instrument(self.span.clone())
            .await?
            .messages)
    }

    async fn effective_context(&self, session_id: &str) -> Result<EffectiveContext> {
        let (messages, snapshot) = futures::try_join!(
            self.store.list_messages(session_id),
            self.store.latest_snapshot(session_id, SnapshotKind::Summary),
        )?;

        let Some(snapshot) = snapshot else {
            debug!(session_id, message_count = messages.len(), "No snapshot, using full history");
            return Ok(EffectiveContext {
                messages,
                summarized: false,
            });
        };

        let Some(cutoff) = messages.iter().find(|m| m.id == snapshot.message_cutoff_id) else {
            warn!(
                session_id,
                snapshot_id = %snapshot.id,
                cutoff_id = %snapshot.message_cutoff_id,
                "Snapshot cutoff message not found, using full history"
            );
            return Ok(EffectiveContext {
                messages,
                summarized: false,
            });
        };

        let cutoff_sequence = cutoff.sequence;
        let mut context = Vec::with_capacity(messages.len() + 1);
        context.push(snapshot.to_system_message(cutoff_sequence));
        context.extend(messages.into_iter().filter(|m| m.sequence > cutoff_sequence));

        debug!(
            session_id,
            snapshot_id = %snapshot.id,
            tail_messages = context.len() - 1,
            "Context built from snapshot"
        );

        Ok(EffectiveContext {
            messages: context,
            summarized: true,
        })
    }

    /// Token usage of a session's context against a model's limits
    pub async fn usage(&self, session_id: &str, provider: &str, model: &str) -> Result<ContextUsage> {
        self.usage_inner(session_id, provider, model)
            .instrument(self.span.clone())
            .await
    }

    async fn usage_inner(&self, session_id: &str, provider: &str, model: &str) -> Result<ContextUsage> {
        let config = self.registry.resolve(provider, model).await?;
        let context = self.effective_context(session_id).await?;
        Ok(self.evaluate(&context, &config))
    }

    fn evaluate(&self, context: &EffectiveContext, config: &ModelConfig) -> ContextUsage {
        let tokens = self.counter.count_messages(&context.messages);
        METRICS.record_context_tokens(tokens);
        ContextUsage::evaluate(tokens, config)
    }

    /// Compact the session if its context has reached the model's threshold
    pub async fn compact_if_needed(
        &self,
        session_id: &str,
        request: &CompactionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome> {
        if !self.config.enabled {
            return Ok(CompactionOutcome::Skipped(SkipReason::Disabled));
        }
        self.run(session_id, request, cancel, true).await
    }

    /// Fold everything older than the retained tail into a new summary snapshot
    pub async fn compact(
        &self,
        session_id: &str,
        request: &CompactionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome> {
        self.run(session_id, request, cancel, false).await
    }

    async fn run(
        &self,
        session_id: &str,
        request: &CompactionRequest,
        cancel: &CancellationToken,
        check_threshold: bool,
    ) -> Result<CompactionOutcome> {
        let result = self
            .compact_locked(session_id, request, cancel, check_threshold)
            .instrument(self.span.clone())
            .await;

        match &result {
            Ok(outcome) => METRICS.record_compaction(outcome.label()),
            Err(ContextError::Cancelled) => METRICS.record_compaction("cancelled"),
            Err(_) => METRICS.record_compaction("failed"),
        }
        result
    }

    async fn compact_locked(
        &self,
        session_id: &str,
        request: &CompactionRequest,
        cancel: &CancellationToken,
        check_threshold: bool,
    ) -> Result<CompactionOutcome> {
        let _lock = SessionLock::acquire(&self.locks, session_id).await;

        // Re-read under the lock so a compaction that just committed is seen
        let config = self.registry.resolve(&request.provider, &request.model).await?;
        let context = self.effective_context(session_id).await?;

        if check_threshold {
            let usage = self.evaluate(&context, &config);
            if !usage.needs_compaction {
                debug!(
                    session_id,
                    context_tokens = usage.context_tokens,
                    threshold_tokens = usage.threshold_tokens,
                    "Below compression threshold"
                );
                return Ok(CompactionOutcome::Skipped(SkipReason::BelowThreshold));
            }
        }

        let split = self.retention_split(&context.messages, config.recommended_retention_tokens);
        let eligible = &context.messages[..split];
        let eligible_real = if context.summarized {
            split.saturating_sub(1)
        } else {
            split
        };

        if eligible_real == 0 || eligible_real < self.config.min_eligible_messages {
            debug!(session_id, eligible = eligible_real, "Not enough messages to compact");
            return Ok(CompactionOutcome::Skipped(SkipReason::NotEnoughMessages {
                eligible: eligible_real,
            }));
        }

        // The eligible prefix ends with a real message, never the synthetic summary
        let cutoff = &context.messages[split - 1];

        info!(
            session_id,
            provider = %request.provider,
            model = %request.model,
            eligible_messages = eligible.len(),
            retained_messages = context.messages.len() - split,
            cutoff_id = %cutoff.id,
            "Compacting session context"
        );

        if cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }

        let options = SummarizationOptions {
            messages: eligible,
            provider: &request.provider,
            model: request.summarization_model.as_deref(),
            api_key: &request.api_key,
            base_url: request.base_url.as_deref(),
            session_id,
            prompt_template: request.prompt_template.as_deref(),
        };

        let summary = match self.summarizer.summarize(options, cancel).await {
            Ok(summary) => summary,
            Err(SummarizerError::Cancelled) => return Err(ContextError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        if cancel.is_cancelled() {
            info!(session_id, "Compaction cancelled before commit");
            return Err(ContextError::Cancelled);
        }

        let token_count = self.counter.count_text(&summary) as u64;
        let snapshot = Snapshot::summary(session_id, summary, cutoff.id.clone(), token_count);
        self.store.insert_snapshot(snapshot.clone()).await?;

        info!(
            session_id,
            snapshot_id = %snapshot.id,
            summary_tokens = token_count,
            messages_folded = eligible_real,
            "Snapshot committed"
        );

        Ok(CompactionOutcome::Compacted(snapshot))
    }

    /// Index of the first message of the newest tail fitting in `retention_tokens`
    fn retention_split(&self, messages: &[Message], retention_tokens: usize) -> usize {
        let mut kept = 0;
        let mut split = messages.len();

        for (index, message) in messages.iter().enumerate().rev() {
            let tokens = self.counter.count_message(message);
            if kept + tokens > retention_tokens {
                break;
            }
            kept += tokens;
            split = index;
        }

        split
    }

    /// Record the provider-reported token usage of a message.
    ///
    /// Best effort: failures are logged, never returned. Later calls overwrite
    /// earlier ones.
    pub async fn record_tokens(&self, message_id: &str, input_tokens: u64, output_tokens: u64) {
        let result = self
            .store
            .update_message_tokens(message_id, input_tokens, output_tokens)
            .instrument(self.span.clone())
            .await;

        match result {
            Ok(()) => debug!(
                parent: &self.span,
                message_id,
                input_tokens,
                output_tokens,
                "Token usage recorded"
            ),
            Err(e) => warn!(
                parent: &self.span,
                message_id,
                error = %e,
                "Failed to record token usage"
            ),
        }
    }
}
