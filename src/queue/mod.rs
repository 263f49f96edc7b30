//! Asynchronous streaming job engine
//!
//! Submission and observation are decoupled: `submit` registers a job and
//! schedules its executor, returning immediately; `attach` opens an event
//! feed for any number of observers, before or after the job finishes.

pub mod bus;
pub mod events;
pub mod jobs;
pub mod relay;
pub mod workers;

pub use bus::{EventBus, Subscription};
pub use events::StreamEvent;
pub use jobs::{Job, JobFailure, JobId, JobStatus, JobStore, JobStoreError, NewJob, Transition};
pub use relay::EventStream;
pub use workers::JobExecutor;

use crate::config::JobConfig;
use crate::llm::StreamingAdapter;
use crate::storage::{new_conversation_id, validate_conversation_id, HistoryStore};
use crate::types::{AppError, AppResult, ConversationTurn, Part};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Binary content attached to a message
#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Bytes,
}

/// A generation request as received at intake
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub prompt: String,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Submission {
    /// Validate and convert into message parts: the prompt text first, then
    /// each attachment inline.
    pub fn message_parts(&self) -> AppResult<Vec<Part>> {
        if self.prompt.trim().is_empty() && self.attachments.is_empty() {
            return Err(AppError::InvalidRequest(
                "a prompt or an attachment is required".to_string(),
            ));
        }

        let mut parts = Vec::with_capacity(self.attachments.len() + 1);
        if !self.prompt.trim().is_empty() {
            parts.push(Part::text(self.prompt.clone()));
        }

        for attachment in &self.attachments {
            if attachment.mime_type.parse::<mime::Mime>().is_err() {
                return Err(AppError::InvalidRequest(format!(
                    "invalid attachment MIME type: {:?}",
                    attachment.mime_type
                )));
            }
            if attachment.data.is_empty() {
                return Err(AppError::InvalidRequest("attachment is empty".to_string()));
            }
            parts.push(Part::inline(
                attachment.mime_type.clone(),
                BASE64.encode(&attachment.data),
            ));
        }

        Ok(parts)
    }
}

/// Returned by `submit` before generation starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: JobId,
    #[serde(rename = "chatId")]
    pub conversation_id: String,
}

pub struct JobService {
    store: Arc<JobStore>,
    bus: EventBus,
    executor: Arc<JobExecutor>,
    history: Arc<dyn HistoryStore>,
    default_model: String,
}

impl JobService {
    pub fn new(
        config: &JobConfig,
        default_model: impl Into<String>,
        provider: Arc<dyn StreamingAdapter>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let store = Arc::new(JobStore::new(config.retention()));
        let bus = EventBus::new();
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            bus.clone(),
            provider,
            history.clone(),
            config.retry_policy(),
            config.attempt_timeout(),
        ));

        Self {
            store,
            bus,
            executor,
            history,
            default_model: default_model.into(),
        }
    }

    /// Register a job and schedule it. Returns without waiting for generation.
    pub async fn submit(&self, submission: Submission) -> AppResult<SubmitReceipt> {
        let message = submission.message_parts()?;
        let model = submission
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model)
            .to_string();

        let (conversation_id, history) = match submission.conversation_id {
            Some(id) => {
                validate_conversation_id(&id)
                    .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
                let prior = self.load_history(&id).await?;
                (id, prior)
            }
            None => (new_conversation_id(), Vec::new()),
        };

        let job_id = self.store.create(NewJob {
            conversation_id: conversation_id.clone(),
            history,
            message,
            model,
        });
        self.executor.spawn(job_id);

        info!(job_id = %job_id, conversation_id = %conversation_id, "Job submitted");
        Ok(SubmitReceipt {
            job_id,
            conversation_id,
        })
    }

    async fn load_history(&self, conversation_id: &str) -> AppResult<Vec<ConversationTurn>> {
        match self.history.read(conversation_id).await? {
            Some(turns) => Ok(turns),
            None => {
                debug!(conversation_id, "No history found, starting a new conversation");
                Ok(Vec::new())
            }
        }
    }

    pub fn status(&self, job_id: JobId) -> AppResult<Job> {
        self.store
            .get(job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))
    }

    /// Open an event feed for one observer.
    pub fn attach(&self, job_id: JobId) -> AppResult<EventStream> {
        relay::attach(&self.store, &self.bus, job_id).map_err(|e| match e {
            JobStoreError::NotFound(id) => AppError::NotFound(format!("job {}", id)),
            other => AppError::Internal(other.to_string()),
        })
    }

    /// Evict expired jobs and their channels. Returns how many were evicted.
    pub fn collect_garbage(&self) -> usize {
        let evicted = self.store.garbage_collect();
        for job_id in &evicted {
            self.bus.close(*job_id);
        }
        evicted.len()
    }

    /// Run `collect_garbage` every `interval` for the life of the process.
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = service.collect_garbage();
                if evicted > 0 {
                    debug!(evicted, "Job garbage collection");
                }
            }
        })
    }

    pub fn jobs(&self) -> &JobStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::workers::testing::{MemoryHistory, Script, ScriptedAdapter};
    use super::*;
    use crate::types::{ProviderError, Role};
    use futures::StreamExt;

    fn service(scripts: Vec<Script>, history: Arc<MemoryHistory>) -> JobService {
        JobService::new(
            &JobConfig::default(),
            "gemini-default",
            Arc::new(ScriptedAdapter::new(scripts)),
            history,
        )
    }

    fn prompt(text: &str) -> Submission {
        Submission {
            prompt: text.to_string(),
            ..Submission::default()
        }
    }

    async fn finish(service: &JobService, job_id: JobId) -> Vec<StreamEvent> {
        service.attach(job_id).unwrap().collect().await
    }

    #[tokio::test]
    async fn test_new_conversation_round_trip() {
        let history = Arc::new(MemoryHistory::default());
        let service = service(vec![Script::fragments(&["He", "llo", "!"])], history.clone());

        let receipt = service.submit(prompt("hello")).await.unwrap();
        let events = finish(&service, receipt.job_id).await;
        assert_eq!(events.last(), Some(&StreamEvent::Completed { total_length: 6, text: None }));

        let job = service.status(receipt.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.model, "gemini-default");

        let turns = history.turns(&receipt.conversation_id);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].first_text(), Some("hello"));
        assert_eq!(turns[1].first_text(), Some("Hello!"));
    }

    #[tokio::test]
    async fn test_existing_conversation_supplies_prior_turns() {
        let history = Arc::new(MemoryHistory::default());
        history.conversations.lock().insert(
            "42".to_string(),
            vec![
                ConversationTurn::user(vec![Part::text("earlier")]),
                ConversationTurn::model("reply"),
            ],
        );
        let service = service(vec![Script::fragments(&["ok"])], history.clone());

        let receipt = service
            .submit(Submission {
                prompt: "next".to_string(),
                conversation_id: Some("42".to_string()),
                model: Some("gemini-pro".to_string()),
                attachments: vec![],
            })
            .await
            .unwrap();
        assert_eq!(receipt.conversation_id, "42");

        let job = service.status(receipt.job_id).unwrap();
        assert_eq!(job.history.len(), 2);
        assert_eq!(job.model, "gemini-pro");

        finish(&service, receipt.job_id).await;
        let turns = history.turns("42");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[3].role, Role::Model);
    }

    #[tokio::test]
    async fn test_unknown_conversation_id_starts_fresh() {
        let history = Arc::new(MemoryHistory::default());
        let service = service(vec![Script::fragments(&["hi"])], history.clone());

        let receipt = service
            .submit(Submission {
                conversation_id: Some("1700000000000".to_string()),
                ..prompt("hello")
            })
            .await
            .unwrap();
        assert!(service.status(receipt.job_id).unwrap().history.is_empty());
        finish(&service, receipt.job_id).await;
        assert_eq!(history.turns("1700000000000").len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_submissions_create_no_job() {
        let service = service(vec![], Arc::new(MemoryHistory::default()));

        let empty = service.submit(prompt("   ")).await;
        assert!(matches!(empty, Err(AppError::InvalidRequest(_))));

        let bad_id = service
            .submit(Submission {
                conversation_id: Some("../../etc".to_string()),
                ..prompt("hello")
            })
            .await;
        assert!(matches!(bad_id, Err(AppError::InvalidRequest(_))));

        let bad_mime = service
            .submit(Submission {
                attachments: vec![Attachment {
                    mime_type: "not a mime".to_string(),
                    data: Bytes::from_static(b"abc"),
                }],
                ..prompt("look")
            })
            .await;
        assert!(matches!(bad_mime, Err(AppError::InvalidRequest(_))));

        assert!(service.jobs().is_empty());
    }

    #[test]
    fn test_attachments_become_inline_parts() {
        let submission = Submission {
            prompt: String::new(),
            attachments: vec![Attachment {
                mime_type: "image/png".to_string(),
                data: Bytes::from_static(b"hello"),
            }],
            ..Submission::default()
        };
        let parts = submission.message_parts().unwrap();
        assert_eq!(parts, vec![Part::inline("image/png", "aGVsbG8=")]);
    }

    #[tokio::test]
    async fn test_permanent_failure_reaches_observer() {
        let service = service(
            vec![Script::Reject(ProviderError::Permanent("invalid credentials".into()))],
            Arc::new(MemoryHistory::default()),
        );
        let receipt = service.submit(prompt("hello")).await.unwrap();

        let events = finish(&service, receipt.job_id).await;
        assert_eq!(
            events,
            vec![StreamEvent::Failed { error: "invalid credentials".into(), retryable: false }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_job_is_not_found() {
        let service = service(vec![Script::fragments(&["done"])], Arc::new(MemoryHistory::default()));
        let receipt = service.submit(prompt("hello")).await.unwrap();
        finish(&service, receipt.job_id).await;
        assert_eq!(service.status(receipt.job_id).unwrap().status, JobStatus::Completed);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(service.collect_garbage(), 1);

        assert!(matches!(service.status(receipt.job_id), Err(AppError::NotFound(_))));
        assert!(matches!(service.attach(receipt.job_id), Err(AppError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_task_evicts_on_schedule() {
        let service = Arc::new(service(
            vec![Script::fragments(&["done"])],
            Arc::new(MemoryHistory::default()),
        ));
        let receipt = service.submit(prompt("hello")).await.unwrap();
        finish(&service, receipt.job_id).await;

        let gc = service.spawn_gc(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(service.status(receipt.job_id).is_err());
        gc.abort();
    }
}
