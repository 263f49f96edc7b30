// Google Gemini adapter implementation
// Streams `models/{model}:streamGenerateContent` over server-sent events.
// API Reference: https://ai.google.dev/api/generate-content
//
// Failures are classified from the HTTP status and the structured error
// body, never from message text.

use crate::config::DEFAULT_GEMINI_API_BASE;
use crate::llm::provider::{FragmentStream, StreamingAdapter};
use crate::types::{ConversationTurn, Part, ProviderError};
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-goog-api-key";
const QUOTA_FAILURE_TYPE: &str = "type.googleapis.com/google.rpc.QuotaFailure";
const FINISH_STOP: &str = "STOP";

pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

// Request types for the Gemini API
#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: crate::types::Role,
    parts: &'a [Part],
}

// Response types for the Gemini API
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Deserialize)]
struct GeminiError {
    code: Option<u16>,
    message: Option<String>,
    status: Option<String>,
    #[serde(default)]
    details: Vec<serde_json::Value>,
}

impl GeminiError {
    fn is_quota_failure(&self) -> bool {
        self.details
            .iter()
            .any(|d| d.get("@type").and_then(|t| t.as_str()) == Some(QUOTA_FAILURE_TYPE))
    }

    fn describe(&self, status: StatusCode) -> String {
        let message = self.message.as_deref().unwrap_or("no message");
        match &self.status {
            Some(code) => format!("Gemini API error ({} {}): {}", status.as_u16(), code, message),
            None => format!("Gemini API error ({}): {}", status.as_u16(), message),
        }
    }
}

impl GeminiAdapter {
    /// Create an adapter against the public Gemini endpoint
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_GEMINI_API_BASE)
    }

    /// Create an adapter against a custom base URL (reverse proxy, test server)
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:streamGenerateContent", self.base_url, model)
    }
}

#[async_trait]
impl StreamingAdapter for GeminiAdapter {
    async fn stream_generate(
        &self,
        history: &[ConversationTurn],
        message: &[Part],
        model: &str,
    ) -> Result<FragmentStream, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Permanent(
                "invalid credentials: GEMINI_API_KEY is not set".to_string(),
            ));
        }
        if model.trim().is_empty() {
            return Err(ProviderError::Permanent("no model selected".to_string()));
        }

        let mut contents: Vec<GeminiContent<'_>> = history
            .iter()
            .map(|turn| GeminiContent {
                role: turn.role,
                parts: &turn.parts,
            })
            .collect();
        contents.push(GeminiContent {
            role: crate::types::Role::User,
            parts: message,
        });

        debug!(model, turns = contents.len(), "Starting Gemini stream");

        let response = self
            .client
            .post(self.endpoint(model))
            .query(&[("alt", "sse")])
            .header(API_KEY_HEADER, &self.api_key)
            .json(&GeminiRequest { contents })
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let stream: FragmentStream = Box::pin(async_stream::stream! {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(EventStreamError::Transport(e)) => {
                        yield Err(classify_transport_error(e));
                        return;
                    }
                    Err(e) => {
                        yield Err(ProviderError::Transient(format!("malformed Gemini event stream: {}", e)));
                        return;
                    }
                };
                if event.data.is_empty() {
                    continue;
                }

                match parse_chunk(&event.data) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }
}

/// Map a non-success HTTP response to a classified failure.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<GeminiErrorResponse>(body).ok();
    let message = match &parsed {
        Some(envelope) => envelope.error.describe(status),
        None if body.trim().is_empty() => format!("Gemini API error ({})", status),
        None => format!("Gemini API error ({}): {}", status, body.trim()),
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            if parsed.map(|e| e.error.is_quota_failure()).unwrap_or(false) {
                ProviderError::Permanent(message)
            } else {
                ProviderError::Transient(message)
            }
        }
        StatusCode::REQUEST_TIMEOUT => ProviderError::Transient(message),
        s if s.is_server_error() => ProviderError::Transient(message),
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::METHOD_NOT_ALLOWED
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Permanent(message),
        _ => {
            warn!(%status, "Unclassified Gemini status, treating as transient");
            ProviderError::Transient(message)
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_builder() {
        return ProviderError::Permanent(format!("invalid Gemini request: {}", err));
    }
    if let Some(status) = err.status() {
        return classify_status(status, "");
    }
    ProviderError::Transient(format!("Gemini request failed: {}", err))
}

/// Decode one SSE `data:` payload into the text it carries, if any.
fn parse_chunk(payload: &str) -> Result<Option<String>, ProviderError> {
    let chunk: GeminiChunk = serde_json::from_str(payload)
        .map_err(|e| ProviderError::Transient(format!("malformed Gemini stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        let status = error
            .code
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": {
                "code": error.code,
                "message": error.message,
                "status": error.status,
                "details": error.details,
            }
        });
        return Err(classify_status(status, &body.to_string()));
    }

    if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ProviderError::Permanent(format!("prompt blocked: {}", reason)));
    }

    let Some(candidate) = chunk.candidates.into_iter().next() else {
        return Ok(None);
    };
    if let Some(reason) = candidate.finish_reason.as_deref() {
        if reason == FINISH_STOP {
            debug!("Gemini finished");
        } else {
            // Cut short; whatever text arrived is still kept.
            warn!(finish_reason = reason, "Gemini stopped before a natural end");
        }
    }

    let text: String = candidate
        .content
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    Ok((!text.is_empty()).then_some(text))
}
