//! Conversation History Persistence
//!
//! Durable, append-oriented record of each conversation's turns. The job
//! engine only needs `append` and `read`; the remaining operations back the
//! history endpoints.

pub mod history;

pub use history::*;

use crate::types::ConversationTurn;
use async_trait::async_trait;
use serde::Serialize;

const MAX_ID_LEN: usize = 128;
const TITLE_MAX_CHARS: usize = 50;
const UNTITLED: &str = "Untitled Chat";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid conversation id: {0:?}")]
    InvalidId(String),

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt history record: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Entry in the history list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub chat_id: String,
    pub title: String,
}

impl ConversationSummary {
    /// Title is the first user text, truncated.
    pub fn from_turns(chat_id: impl Into<String>, turns: &[ConversationTurn]) -> Self {
        let title = turns
            .iter()
            .find(|t| t.role == crate::types::Role::User)
            .and_then(ConversationTurn::first_text)
            .map(|text| text.chars().take(TITLE_MAX_CHARS).collect::<String>())
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| UNTITLED.to_string());

        Self {
            chat_id: chat_id.into(),
            title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub turns: Vec<ConversationTurn>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append turns to a conversation, creating the record if needed.
    async fn append(&self, conversation_id: &str, turns: &[ConversationTurn]) -> Result<(), StorageError>;

    /// Full ordered turn sequence, or `None` if the conversation does not exist.
    async fn read(&self, conversation_id: &str) -> Result<Option<Vec<ConversationTurn>>, StorageError>;

    /// Summaries of all conversations, newest first.
    async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError>;

    /// Most recent conversation, if any.
    async fn latest(&self) -> Result<Option<Conversation>, StorageError>;

    async fn delete(&self, conversation_id: &str) -> Result<(), StorageError>;
}

/// Conversation ids name files on disk, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_conversation_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}

/// Mint an id for a new conversation: millisecond timestamp plus a short
/// random suffix, so ids still sort by creation time.
pub fn new_conversation_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), &suffix[..6])
}
