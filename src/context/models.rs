//! Data models for conversation context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Author role of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Whether tokens of this role count toward the prompt side of a conversation
    pub fn is_input(&self) -> bool {
        match self {
            Role::System | Role::User | Role::Tool => true,
            Role::Assistant => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Running => "running",
            ToolStatus::Completed => "completed",
            ToolStatus::Error => "error",
        }
    }
}

/// One structural unit of a message's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        content: String,
    },
    ToolInvocation {
        tool_name: String,
        tool_call_id: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_text: Option<String>,
        status: ToolStatus,
    },
    ToolResult {
        related_tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Attachment {
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// Never sent to a model: excluded from token counts and summaries
    Metadata {
        #[serde(default)]
        payload: Value,
    },
}

impl Part {
    pub fn text(content: impl Into<String>) -> Self {
        Part::Text {
            content: content.into(),
        }
    }
}

/// A single message in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    /// Strictly increasing within a session
    pub sequence: u64,
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, sequence: u64, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            sequence,
            parts,
            created_at: Utc::now(),
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// First text part, if any
    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            Part::Text { content } => Some(content.as_str()),
            _ => None,
        })
    }
}

/// Kind of compaction checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Summary,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Summary => "summary",
        }
    }
}

/// Payload of a snapshot: plain summary text or a structured object holding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotContent {
    Text(String),
    Structured(Value),
}

impl SnapshotContent {
    /// Summary text carried by this payload.
    ///
    /// Structured payloads expose their `text` field; anything else is
    /// rendered as JSON.
    pub fn text(&self) -> String {
        match self {
            SnapshotContent::Text(text) => text.clone(),
            SnapshotContent::Structured(value) => match value.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => value.to_string(),
            },
        }
    }
}

impl From<String> for SnapshotContent {
    fn from(text: String) -> Self {
        SnapshotContent::Text(text)
    }
}

impl From<&str> for SnapshotContent {
    fn from(text: &str) -> Self {
        SnapshotContent::Text(text.to_string())
    }
}

/// Point-in-time checkpoint folding all messages up to `message_cutoff_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub kind: SnapshotKind,
    pub content: SnapshotContent,
    /// Id of the last message folded into this snapshot. Not owned; may dangle.
    pub message_cutoff_id: String,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn summary(
        session_id: impl Into<String>,
        content: impl Into<SnapshotContent>,
        message_cutoff_id: impl Into<String>,
        token_count: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            kind: SnapshotKind::Summary,
            content: content.into(),
            message_cutoff_id: message_cutoff_id.into(),
            token_count,
            created_at: Utc::now(),
        }
    }

    /// Render the snapshot as the synthetic leading system message of a context
    pub fn to_system_message(&self, sequence: u64) -> Message {
        Message {
            id: format!("snapshot:{}", self.id),
            session_id: self.session_id.clone(),
            role: Role::System,
            sequence,
            parts: vec![Part::text(self.content.text())],
            created_at: self.created_at,
            input_tokens: None,
            output_tokens: None,
        }
    }
}

/// Categorized token counts for a conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCountResult {
    pub total_tokens: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub estimated_response_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_serializes_with_kind_tag() {
        let part = Part::ToolInvocation {
            tool_name: "search".to_string(),
            tool_call_id: "call_1".to_string(),
            input: json!({"q": "rust"}),
            input_text: None,
            status: ToolStatus::Completed,
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["kind"], "tool_invocation");
        assert_eq!(value["status"], "completed");

        let back: Part = serde_json::from_value(value).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn test_role_input_classification() {
        assert!(Role::System.is_input());
        assert!(Role::User.is_input());
        assert!(Role::Tool.is_input());
        assert!(!Role::Assistant.is_input());
    }

    #[test]
    fn test_structured_snapshot_content_text() {
        let content = SnapshotContent::Structured(json!({"text": "Summary", "details": ["a"]}));
        assert_eq!(content.text(), "Summary");

        let content = SnapshotContent::Structured(json!({"points": [1, 2]}));
        assert_eq!(content.text(), r#"{"points":[1,2]}"#);
    }

    #[test]
    fn test_snapshot_as_system_message() {
        let snapshot = Snapshot::summary("s1", "Summary of early conversation", "m1", 10);
        let message = snapshot.to_system_message(1);
        assert_eq!(message.role, Role::System);
        assert_eq!(message.text(), Some("Summary of early conversation"));
        assert_eq!(message.session_id, "s1");
    }
}
