//! In-memory store backed by DashMap

use super::{ConfigStore, SessionStore, StoreError, StoreResult};
use crate::context::model_registry::{ModelConfig, ModelConfigUpdate};
use crate::context::models::{Message, Part, Role, Snapshot, SnapshotKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
struct SessionRecord {
    messages: Vec<Message>,
    /// Append-only, in creation order
    snapshots: Vec<Snapshot>,
}

/// Thread-safe in-memory implementation of both store traits
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: DashMap<String, ModelConfig>,
    sessions: DashMap<String, SessionRecord>,
    /// message id -> session id
    message_index: DashMap<String, String>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty session and return its id
    pub fn create_session(&self) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(session_id.clone(), SessionRecord::default());
        debug!(session_id = %session_id, "Session created");
        session_id
    }

    /// Append a message with the next sequence number of the session
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        parts: Vec<Part>,
    ) -> StoreResult<Message> {
        self.check_available()?;

        let mut record = self.sessions.entry(session_id.to_string()).or_default();
        let sequence = record.messages.last().map_or(1, |m| m.sequence + 1);
        let message = Message::new(session_id, sequence, role, parts);

        record.messages.push(message.clone());
        self.message_index
            .insert(message.id.clone(), session_id.to_string());

        Ok(message)
    }

    /// Simulate the backing store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_config(&self, id: &str) -> StoreResult<Option<ModelConfig>> {
        self.check_available()?;
        Ok(self.configs.get(id).map(|c| c.value().clone()))
    }

    async fn insert_config(&self, config: ModelConfig) -> StoreResult<()> {
        self.check_available()?;
        match self.configs.entry(config.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "model config {} already exists",
                config.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(config);
                Ok(())
            }
        }
    }

    async fn upsert_config(&self, mut config: ModelConfig) -> StoreResult<ModelConfig> {
        self.check_available()?;
        match self.configs.entry(config.id.clone()) {
            Entry::Occupied(mut slot) => {
                config.created_at = slot.get().created_at;
                slot.insert(config.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(config.clone());
            }
        }
        Ok(config)
    }

    async fn update_config(
        &self,
        id: &str,
        update: &ModelConfigUpdate,
        now: DateTime<Utc>,
    ) -> StoreResult<ModelConfig> {
        self.check_available()?;
        let mut config = self.configs.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "model config",
            id: id.to_string(),
        })?;
        update.apply(&mut config, now);
        Ok(config.clone())
    }

    async fn delete_config(&self, id: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.configs.remove(id).is_some())
    }

    async fn list_configs(&self) -> StoreResult<Vec<ModelConfig>> {
        self.check_available()?;
        let mut configs: Vec<ModelConfig> = self.configs.iter().map(|c| c.value().clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_message(&self, message: Message) -> StoreResult<()> {
        self.check_available()?;

        if self.message_index.contains_key(&message.id) {
            return Err(StoreError::Conflict(format!(
                "message {} already exists",
                message.id
            )));
        }

        let mut record = self.sessions.entry(message.session_id.clone()).or_default();
        if let Some(last) = record.messages.last() {
            if message.sequence <= last.sequence {
                return Err(StoreError::Conflict(format!(
                    "sequence {} not after {} in session {}",
                    message.sequence, last.sequence, message.session_id
                )));
            }
        }

        self.message_index
            .insert(message.id.clone(), message.session_id.clone());
        record.messages.push(message);
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> StoreResult<Vec<Message>> {
        self.check_available()?;
        Ok(self
            .sessions
            .get(session_id)
            .map(|record| record.messages.clone())
            .unwrap_or_default())
    }

    async fn get_message(&self, message_id: &str) -> StoreResult<Option<Message>> {
        self.check_available()?;
        let Some(session_id) = self.message_index.get(message_id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        Ok(self.sessions.get(&session_id).and_then(|record| {
            record.messages.iter().find(|m| m.id == message_id).cloned()
        }))
    }

    async fn update_message_tokens(
        &self,
        message_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> StoreResult<()> {
        self.check_available()?;
        let not_found = || StoreError::NotFound {
            entity: "message",
            id: message_id.to_string(),
        };

        let session_id = self
            .message_index
            .get(message_id)
            .map(|s| s.value().clone())
            .ok_or_else(not_found)?;
        let mut record = self.sessions.get_mut(&session_id).ok_or_else(not_found)?;
        let message = record
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(not_found)?;

        message.input_tokens = Some(input_tokens);
        message.output_tokens = Some(output_tokens);
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: Snapshot) -> StoreResult<()> {
        self.check_available()?;
        self.sessions
            .entry(snapshot.session_id.clone())
            .or_default()
            .snapshots
            .push(snapshot);
        Ok(())
    }

    async fn list_snapshots(&self, session_id: &str) -> StoreResult<Vec<Snapshot>> {
        self.check_available()?;
        Ok(self
            .sessions
            .get(session_id)
            .map(|record| record.snapshots.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn latest_snapshot(
        &self,
        session_id: &str,
        kind: SnapshotKind,
    ) -> StoreResult<Option<Snapshot>> {
        self.check_available()?;
        Ok(self.sessions.get(session_id).and_then(|record| {
            record
                .snapshots
                .iter()
                .rev()
                .find(|s| s.kind == kind)
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_append_assigns_increasing_sequence() {
        let store = MemoryStore::new();
        let session = store.create_session();

        let first = store.append_message(&session, Role::User, vec![Part::text("a")]).unwrap();
        let second = store
            .append_message(&session, Role::Assistant, vec![Part::text("b")])
            .unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);

        let messages = store.list_messages(&session).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, first.id);
    }

    #[tokio::test]
    async fn test_insert_rejects_non_increasing_sequence() {
        let store = MemoryStore::new();
        assert_ok!(store.insert_message(Message::new("s", 5, Role::User, vec![])).await);
        assert_err!(store.insert_message(Message::new("s", 5, Role::User, vec![])).await);
        assert_ok!(store.insert_message(Message::new("s", 7, Role::User, vec![])).await);
    }

    #[tokio::test]
    async fn test_snapshots_newest_first() {
        let store = MemoryStore::new();
        let session = store.create_session();
        let msg = store.append_message(&session, Role::User, vec![Part::text("Test")]).unwrap();

        assert!(store.latest_snapshot(&session, SnapshotKind::Summary).await.unwrap().is_none());
        assert!(store.list_snapshots(&session).await.unwrap().is_empty());

        store
            .insert_snapshot(Snapshot::summary(&session, "First", &msg.id, 50))
            .await
            .unwrap();
        store
            .insert_snapshot(Snapshot::summary(&session, "Second", &msg.id, 60))
            .await
            .unwrap();

        let snapshots = store.list_snapshots(&session).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].content.text(), "Second");
        assert_eq!(snapshots[1].content.text(), "First");

        let latest = store
            .latest_snapshot(&session, SnapshotKind::Summary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.token_count, 60);
        assert_eq!(latest.message_cutoff_id, msg.id);
    }

    #[tokio::test]
    async fn test_update_tokens_last_write_wins() {
        let store = MemoryStore::new();
        let session = store.create_session();
        let msg = store.append_message(&session, Role::User, vec![Part::text("Test")]).unwrap();

        store.update_message_tokens(&msg.id, 100, 50).await.unwrap();
        store.update_message_tokens(&msg.id, 200, 75).await.unwrap();

        let stored = store.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.input_tokens, Some(200));
        assert_eq!(stored.output_tokens, Some(75));

        let missing = store.update_message_tokens("nope", 1, 1).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_operations() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.list_messages("s").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_ok!(store.list_messages("s").await);
    }
}
