use crate::config::LLMConfig;
use crate::types::{ConversationTurn, Part, ProviderError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Lazy, finite, non-restartable sequence of generated text fragments.
/// An `Err` item terminates the sequence abnormally.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// A streaming text-generation backend.
///
/// Every failure must carry a [`ProviderError`] classification: the job
/// executor retries `Transient` failures and surfaces `Permanent` ones
/// immediately.
#[async_trait]
pub trait StreamingAdapter: Send + Sync {
    async fn stream_generate(
        &self,
        history: &[ConversationTurn],
        message: &[Part],
        model: &str,
    ) -> Result<FragmentStream, ProviderError>;
}

/// Build the configured provider adapter.
pub fn create_adapter(config: &LLMConfig) -> Arc<dyn StreamingAdapter> {
    Arc::new(crate::llm::google::GeminiAdapter::with_base_url(
        &config.gemini_api_key,
        &config.gemini_api_base,
    ))
}
