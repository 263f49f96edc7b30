use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tracing::info;

use crate::models::{AppState, ConversationResponse, DeleteResponse};
use crate::storage::ConversationSummary;
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/history", get(list_conversations))
        .route(
            "/api/history/{chat_id}",
            get(get_conversation).delete(delete_conversation),
        )
        .with_state(state)
}

/// Newest conversation first
pub async fn list_conversations(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.history.list().await?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> AppResult<Json<ConversationResponse>> {
    let messages = state
        .history
        .read(&chat_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("conversation {}", chat_id)))?;
    Ok(Json(ConversationResponse { chat_id, messages }))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    state.history.delete(&chat_id).await?;
    info!(chat_id = %chat_id, "Conversation deleted");
    Ok(Json(DeleteResponse { success: true }))
}
