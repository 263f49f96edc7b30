//! File-backed conversation history
//!
//! One pretty-printed JSON array of turns per conversation, stored as
//! `{dir}/{conversation_id}.json`.

use super::{validate_conversation_id, Conversation, ConversationSummary, HistoryStore, StorageError};
use crate::types::ConversationTurn;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EXTENSION: &str = "json";

pub struct FileHistoryStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles so concurrent appends don't drop turns.
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the storage directory exists
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    fn path_for(&self, conversation_id: &str) -> Result<PathBuf, StorageError> {
        validate_conversation_id(conversation_id)?;
        Ok(self.dir.join(format!("{}.{}", conversation_id, EXTENSION)))
    }

    async fn read_path(path: &Path) -> Result<Option<Vec<ConversationTurn>>, StorageError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temp file and rename so readers never see a half-written record.
    async fn write_path(path: &Path, turns: &[ConversationTurn]) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(turns)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Conversation ids present on disk, newest first.
    async fn conversation_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_conversation_id(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }

        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, conversation_id: &str, turns: &[ConversationTurn]) -> Result<(), StorageError> {
        let path = self.path_for(conversation_id)?;
        let _guard = self.write_lock.lock().await;

        self.ensure_dir().await?;
        let mut record = Self::read_path(&path).await?.unwrap_or_default();
        record.extend_from_slice(turns);
        Self::write_path(&path, &record).await?;

        debug!(
            conversation_id,
            appended = turns.len(),
            total = record.len(),
            "Appended conversation turns"
        );
        Ok(())
    }

    async fn read(&self, conversation_id: &str) -> Result<Option<Vec<ConversationTurn>>, StorageError> {
        let path = self.path_for(conversation_id)?;
        Self::read_path(&path).await
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut summaries = Vec::new();
        for id in self.conversation_ids().await? {
            match self.read(&id).await {
                Ok(Some(turns)) => summaries.push(ConversationSummary::from_turns(id, &turns)),
                Ok(None) => {}
                Err(e) => warn!(conversation_id = %id, "Skipping unreadable history: {}", e),
            }
        }
        Ok(summaries)
    }

    async fn latest(&self) -> Result<Option<Conversation>, StorageError> {
        let Some(id) = self.conversation_ids().await?.into_iter().next() else {
            return Ok(None);
        };
        let turns = self.read(&id).await?.unwrap_or_default();
        Ok(Some(Conversation { id, turns }))
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StorageError> {
        let path = self.path_for(conversation_id)?;
        let _guard = self.write_lock.lock().await;

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(conversation_id, "Deleted conversation history");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(conversation_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
