//! Persistence contract for model configs, messages and snapshots
//!
//! The compaction core only depends on these traits. [`MemoryStore`] is the
//! in-process implementation used by embedders without a database and by
//! the test suite.

pub mod memory;

pub use memory::MemoryStore;

use crate::context::model_registry::{ModelConfig, ModelConfigUpdate};
use crate::context::models::{Message, Snapshot, SnapshotKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Model capacity configs keyed by `provider:model`
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, id: &str) -> StoreResult<Option<ModelConfig>>;

    /// Insert a new row; `Conflict` if the id exists
    async fn insert_config(&self, config: ModelConfig) -> StoreResult<()>;

    /// Insert or replace by id, keeping the existing `created_at`
    async fn upsert_config(&self, config: ModelConfig) -> StoreResult<ModelConfig>;

    /// Apply the provided fields only and stamp `last_updated`
    async fn update_config(
        &self,
        id: &str,
        update: &ModelConfigUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<ModelConfig>;

    /// Returns whether a row was removed
    async fn delete_config(&self, id: &str) -> StoreResult<bool>;

    async fn list_configs(&self) -> StoreResult<Vec<ModelConfig>>;
}

/// Session messages and compaction snapshots
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_message(&self, message: Message) -> StoreResult<()>;

    /// Messages of a session in ascending sequence order
    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<Message>>;

    async fn get_message(&self, message_id: &str) -> StoreResult<Option<Message>>;

    /// Overwrite the recorded token counts of a message
    async fn update_message_tokens(
        &self,
        message_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> StoreResult<()>;

    async fn insert_snapshot(&self, snapshot: Snapshot) -> StoreResult<()>;

    /// Snapshots of a session, most recently created first
    async fn list_snapshots(&self, session_id: &str) -> StoreResult<Vec<Snapshot>>;

    /// Most recently created snapshot of `kind`
    async fn latest_snapshot(
        &self,
        session_id: &str,
        kind: SnapshotKind,
    ) -> StoreResult<Option<Snapshot>>;
}
