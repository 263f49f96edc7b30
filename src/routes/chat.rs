use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{AppState, ChatRequest, LatestChatResponse};
use crate::queue::{Attachment, Job, JobId, StreamEvent, SubmitReceipt, Submission};
use crate::types::{AppError, AppResult};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(post_chat))
        .route(
            "/api/chat/upload",
            post(upload_chat).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/chat/latest", get(latest_chat))
        .route("/api/chat/{job_id}", get(job_status))
        .route("/api/chat/{job_id}/stream", get(stream_job))
        .with_state(state)
}

/// Submit a prompt. Answers 202 as soon as the job is registered.
pub async fn post_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> AppResult<(StatusCode, Json<SubmitReceipt>)> {
    let submission = Submission::try_from(request)?;
    let receipt = state.jobs.submit(submission).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Multipart variant of `post_chat` for file uploads.
///
/// Text fields `prompt`, `chatId` and `model`; every other field is treated
/// as an attachment.
pub async fn upload_chat(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<SubmitReceipt>)> {
    let mut submission = Submission::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidRequest(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "prompt" | "chatId" | "model" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::InvalidRequest(format!("unreadable field {}: {}", name, e)))?;
                match name.as_str() {
                    "prompt" => submission.prompt = value,
                    "chatId" if !value.is_empty() => submission.conversation_id = Some(value),
                    "model" => submission.model = Some(value),
                    _ => {}
                }
            }
            _ => {
                let mime_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::InvalidRequest(format!("unreadable upload: {}", e)))?;
                info!(file_name = ?file_name, mime_type = %mime_type, size = data.len(), "Received attachment");
                submission.attachments.push(Attachment { mime_type, data });
            }
        }
    }

    let receipt = state.jobs.submit(submission).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Job>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.jobs.status(job_id)?))
}

/// Server-sent events for one job. The event name is the event type and the
/// data is the JSON-encoded event.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let job_id = parse_job_id(&job_id)?;
    let events = state.jobs.attach(job_id)?;
    info!(job_id = %job_id, "Observer attached");

    let stream = events.map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

pub async fn latest_chat(State(state): State<AppState>) -> AppResult<Json<LatestChatResponse>> {
    let response = match state.history.latest().await? {
        Some(conversation) => LatestChatResponse {
            chat_id: Some(conversation.id),
            messages: conversation.turns,
        },
        None => LatestChatResponse {
            chat_id: None,
            messages: Vec::new(),
        },
    };
    Ok(Json(response))
}

// An unparseable id cannot name a job, so it is reported like an unknown one.
fn parse_job_id(raw: &str) -> AppResult<JobId> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound(format!("job {}", raw)))
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.kind())
        .json_data(event)
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode stream event");
            Event::default().event("warning").data("unencodable event")
        })
}
