use crate::config::Config;
use crate::queue::{Attachment, JobService, Submission};
use crate::storage::HistoryStore;
use crate::types::{AppError, AppResult, ConversationTurn};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jobs: Arc<JobService>,
    pub history: Arc<dyn HistoryStore>,
}

/// JSON body of `POST /api/chat`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    pub chat_id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

/// Attachment carried inline as base64
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub mime_type: String,
    pub data: String,
}

impl TryFrom<ChatRequest> for Submission {
    type Error = AppError;

    fn try_from(request: ChatRequest) -> AppResult<Self> {
        let attachments = request
            .attachments
            .into_iter()
            .map(|a| {
                let data = BASE64.decode(a.data.trim()).map_err(|e| {
                    AppError::InvalidRequest(format!("attachment is not valid base64: {}", e))
                })?;
                Ok(Attachment {
                    mime_type: a.mime_type,
                    data: data.into(),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Submission {
            prompt: request.prompt,
            conversation_id: request.chat_id.filter(|id| !id.is_empty()),
            model: request.model,
            attachments,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestChatResponse {
    pub chat_id: Option<String>,
    pub messages: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub chat_id: String,
    pub messages: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub active_jobs: usize,
    pub tracked_jobs: usize,
}
