//! Stream events emitted for a job
//!
//! Serialized as internally tagged JSON records, e.g.
//! `{"type":"fragment","role":"model","text":"He"}`.

use crate::types::Role;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental generated text
    Fragment { role: Role, text: String },

    /// An attempt failed transiently; text streamed so far is discarded and
    /// generation restarts. `attempt` is the 1-based retry number.
    #[serde(rename_all = "camelCase")]
    Retrying { attempt: u32, max_attempts: u32 },

    /// Generation finished. `text` is present only on a snapshot replayed to
    /// an observer that attached after the job finished.
    #[serde(rename_all = "camelCase")]
    Completed {
        total_length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Generation failed. `retryable` tells the client whether a fresh
    /// submission may succeed.
    Failed { error: String, retryable: bool },

    /// Non-fatal problem, e.g. history could not be saved
    Warning { message: String },
}

impl StreamEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        StreamEvent::Fragment {
            role: Role::Model,
            text: text.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed { .. } | StreamEvent::Failed { .. })
    }

    /// Tag used as the SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Fragment { .. } => "fragment",
            StreamEvent::Retrying { .. } => "retrying",
            StreamEvent::Completed { .. } => "completed",
            StreamEvent::Failed { .. } => "failed",
            StreamEvent::Warning { .. } => "warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(StreamEvent::fragment("He")).unwrap();
        assert_eq!(value, serde_json::json!({"type": "fragment", "role": "model", "text": "He"}));

        let value = serde_json::to_value(StreamEvent::Retrying { attempt: 1, max_attempts: 3 }).unwrap();
        assert_eq!(value, serde_json::json!({"type": "retrying", "attempt": 1, "maxAttempts": 3}));

        let live = StreamEvent::Completed { total_length: 6, text: None };
        assert_eq!(
            serde_json::to_value(&live).unwrap(),
            serde_json::json!({"type": "completed", "totalLength": 6})
        );

        let failed = StreamEvent::Failed { error: "invalid credentials".into(), retryable: false };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"type": "failed", "error": "invalid credentials", "retryable": false})
        );
    }

    #[test]
    fn test_terminal_and_kind() {
        assert!(StreamEvent::Completed { total_length: 0, text: None }.is_terminal());
        assert!(StreamEvent::Failed { error: String::new(), retryable: true }.is_terminal());
        assert!(!StreamEvent::fragment("x").is_terminal());
        assert!(!StreamEvent::Warning { message: "w".into() }.is_terminal());
        assert_eq!(StreamEvent::Warning { message: "w".into() }.kind(), "warning");
    }
}
