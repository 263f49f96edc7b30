//! Job Executor
//!
//! Runs one job to completion in the background, independent of whether
//! anyone is watching:
//!
//! 1. `pending -> processing`, then call the provider adapter.
//! 2. Each fragment is appended to the job and published.
//! 3. Transient failures discard the attempt's text, publish `retrying`,
//!    back off and start over, up to the retry cap. Permanent failures and an
//!    exhausted budget end in `failed`.
//! 4. On success the exchange is appended to the conversation history (if any
//!    text was produced), then `completed` is published. A history failure
//!    only produces a `warning`.
//!
//! An attempt that waits longer than the timeout for the stream or for its
//! next fragment fails transiently.

use crate::llm::StreamingAdapter;
use crate::queue::bus::EventBus;
use crate::queue::events::StreamEvent;
use crate::queue::jobs::{Job, JobFailure, JobId, JobStore, Transition};
use crate::storage::HistoryStore;
use crate::types::{ConversationTurn, ProviderError};
use crate::utils::RetryPolicy;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub struct JobExecutor {
    store: Arc<JobStore>,
    bus: EventBus,
    provider: Arc<dyn StreamingAdapter>,
    history: Arc<dyn HistoryStore>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl JobExecutor {
    pub fn new(
        store: Arc<JobStore>,
        bus: EventBus,
        provider: Arc<dyn StreamingAdapter>,
        history: Arc<dyn HistoryStore>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            provider,
            history,
            policy,
            attempt_timeout,
        }
    }

    /// Run the job on its own task. The task outlives every observer.
    pub fn spawn(self: &Arc<Self>, job_id: JobId) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.run(job_id).await })
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn run(&self, job_id: JobId) {
        if let Err(e) = self.store.transition(job_id, Transition::Start) {
            warn!("Job cannot start: {}", e);
            return;
        }
        let Some(job) = self.store.get(job_id) else {
            warn!("Job vanished before it started");
            return;
        };

        info!(
            conversation_id = %job.conversation_id,
            model = %job.model,
            prior_turns = job.history.len(),
            "Processing job"
        );

        match self.generate(&job).await {
            Ok(text) => self.complete(&job, text).await,
            Err(err) => self.fail(job_id, err),
        }

        self.bus.close(job_id);
    }

    /// Attempt loop: returns the final text, or the failure that ended the job.
    async fn generate(&self, job: &Job) -> Result<String, ProviderError> {
        let mut retries = 0;
        loop {
            let err = match self.attempt(job).await {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            if !err.is_retryable() || !self.policy.allows_retry(retries) {
                return Err(err);
            }

            retries = self
                .store
                .discard_attempt(job.id)
                .unwrap_or(retries + 1);
            let delay = self.policy.delay_for(retries);
            warn!(
                retry = retries,
                max_retries = self.policy.max_retries(),
                delay_ms = delay.as_millis() as u64,
                "Transient provider failure, retrying: {}",
                err
            );

            self.bus.publish(
                job.id,
                StreamEvent::Retrying {
                    attempt: retries,
                    max_attempts: self.policy.max_retries(),
                },
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One provider call, streamed to completion or failure.
    ///
    /// The timeout bounds the wait for the stream and for each fragment, so a
    /// long reply that keeps producing text is never cut off.
    async fn attempt(&self, job: &Job) -> Result<String, ProviderError> {
        let mut fragments = tokio::time::timeout(
            self.attempt_timeout,
            self.provider
                .stream_generate(&job.history, &job.message, &job.model),
        )
        .await
        .map_err(|_| self.stalled())??;

        let mut text = String::new();
        loop {
            let next = tokio::time::timeout(self.attempt_timeout, fragments.next())
                .await
                .map_err(|_| self.stalled())?;
            let Some(fragment) = next else { break };

            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            text.push_str(&fragment);
            if let Err(e) = self.store.append_text(job.id, &fragment) {
                error!("Failed to record fragment: {}", e);
            }
            self.bus.publish(job.id, StreamEvent::fragment(fragment));
        }
        Ok(text)
    }

    fn stalled(&self) -> ProviderError {
        ProviderError::Transient(format!(
            "provider stalled for more than {}s",
            self.attempt_timeout.as_secs_f32()
        ))
    }

    async fn complete(&self, job: &Job, text: String) {
        if text.is_empty() {
            info!("Provider returned no text, skipping history");
        } else {
            let turns = [
                ConversationTurn::user(job.message.to_vec()),
                ConversationTurn::model(text.as_str()),
            ];
            if let Err(e) = self.history.append(&job.conversation_id, &turns).await {
                warn!(conversation_id = %job.conversation_id, "Failed to save history: {}", e);
                self.bus.publish(
                    job.id,
                    StreamEvent::Warning {
                        message: format!("The reply could not be saved to history: {}", e),
                    },
                );
            }
        }

        if let Err(e) = self.store.transition(job.id, Transition::Complete) {
            error!("Failed to mark job completed: {}", e);
        }

        let total_length = text.chars().count();
        info!(total_length, "Job completed");
        self.bus.publish(
            job.id,
            StreamEvent::Completed {
                total_length,
                text: None,
            },
        );
    }

    fn fail(&self, job_id: JobId, err: ProviderError) {
        let failure = JobFailure {
            error: err.message().to_string(),
            retryable: err.is_retryable(),
        };
        warn!(retryable = failure.retryable, "Job failed: {}", failure.error);

        if let Err(e) = self.store.transition(job_id, Transition::Fail(failure.clone())) {
            error!("Failed to mark job failed: {}", e);
        }
        self.bus.publish(
            job_id,
            StreamEvent::Failed {
                error: failure.error,
                retryable: failure.retryable,
            },
        );
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{MemoryHistory, Script, ScriptedAdapter};
    use super::*;
    use crate::queue::jobs::{JobStatus, NewJob};
    use crate::types::{Part, Role};

    const CAP: u32 = 3;

    struct Harness {
        store: Arc<JobStore>,
        bus: EventBus,
        adapter: Arc<ScriptedAdapter>,
        history: Arc<MemoryHistory>,
        executor: Arc<JobExecutor>,
    }

    fn harness(scripts: Vec<Script>, history: MemoryHistory) -> Harness {
        let store = Arc::new(JobStore::new(Duration::from_secs(300)));
        let bus = EventBus::new();
        let adapter = Arc::new(ScriptedAdapter::new(scripts));
        let history = Arc::new(history);
        let executor = Arc::new(JobExecutor::new(
            store.clone(),
            bus.clone(),
            adapter.clone(),
            history.clone(),
            RetryPolicy::new(CAP, Duration::from_millis(500), Duration::from_secs(4)),
            Duration::from_secs(30),
        ));
        Harness {
            store,
            bus,
            adapter,
            history,
            executor,
        }
    }

    impl Harness {
        fn submit(&self, prompt: &str) -> JobId {
            self.store.create(NewJob {
                conversation_id: "conv-1".to_string(),
                history: vec![],
                message: vec![Part::text(prompt)],
                model: "gemini-test".to_string(),
            })
        }

        /// Run the job to completion while observing it from the start.
        async fn run_observed(&self, job_id: JobId) -> Vec<StreamEvent> {
            let mut sub = self.bus.subscribe(job_id);
            self.executor.run(job_id).await;
            let mut events = Vec::new();
            while let Some(event) = sub.recv().await {
                events.push(event);
            }
            events
        }
    }

    fn retrying(events: &[StreamEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Retrying { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_generation_is_streamed_and_saved() {
        let h = harness(vec![Script::fragments(&["He", "llo", "!"])], MemoryHistory::default());
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::fragment("He"),
                StreamEvent::fragment("llo"),
                StreamEvent::fragment("!"),
                StreamEvent::Completed { total_length: 6, text: None },
            ]
        );

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.text, "Hello!");

        let turns = h.history.turns("conv-1");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].first_text(), Some("hello"));
        assert_eq!(turns[1].role, Role::Model);
        assert_eq!(turns[1].first_text(), Some("Hello!"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = harness(
            vec![
                Script::transient(),
                Script::transient(),
                Script::fragments(&["third", " time"]),
            ],
            MemoryHistory::default(),
        );
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(retrying(&events), vec![1, 2]);
        let first_fragment = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Fragment { .. }))
            .unwrap();
        assert_eq!(first_fragment, 2);
        assert!(events.last().unwrap().is_terminal());

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.text, "third time");
        assert_eq!(job.retries, 2);
        assert_eq!(h.adapter.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_text_from_failed_attempt_is_discarded() {
        let h = harness(
            vec![
                Script::Stream(vec![
                    Ok("part".to_string()),
                    Err(ProviderError::Transient("stream reset".into())),
                ]),
                Script::fragments(&["full answer"]),
            ],
            MemoryHistory::default(),
        );
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::fragment("part"),
                StreamEvent::Retrying { attempt: 1, max_attempts: CAP },
                StreamEvent::fragment("full answer"),
                StreamEvent::Completed { total_length: 11, text: None },
            ]
        );
        assert_eq!(h.store.get(id).unwrap().text, "full answer");
        assert_eq!(h.history.turns("conv-1")[1].first_text(), Some("full answer"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(
            vec![Script::Reject(ProviderError::Permanent("invalid credentials".into()))],
            MemoryHistory::default(),
        );
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(
            events,
            vec![StreamEvent::Failed {
                error: "invalid credentials".into(),
                retryable: false
            }]
        );

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 0);
        assert_eq!(h.adapter.calls(), 1);
        assert_eq!(h.history.append_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_as_retryable() {
        let scripts = (0..=CAP).map(|_| Script::transient()).collect();
        let h = harness(scripts, MemoryHistory::default());
        let id = h.submit("hello");

        let started = tokio::time::Instant::now();
        let events = h.run_observed(id).await;

        assert_eq!(retrying(&events), vec![1, 2, 3]);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Failed {
                error: "connection reset".into(),
                retryable: true
            })
        );

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, CAP);
        assert_eq!(h.adapter.calls(), CAP as usize + 1);
        assert_eq!(h.history.append_calls(), 0);
        // 500ms + 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_transient() {
        let h = harness(
            vec![Script::Hang, Script::fragments(&["late but fine"])],
            MemoryHistory::default(),
        );
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(retrying(&events), vec![1]);
        assert_eq!(h.store.get(id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_reply_outlives_the_timeout() {
        // Four fragments 20s apart: 80s in total against a 30s timeout
        let fragments = ["one", " two", " three", " four"].map(String::from).to_vec();
        let h = harness(
            vec![Script::Paced(fragments, Duration::from_secs(20))],
            MemoryHistory::default(),
        );
        let id = h.submit("hello");

        let started = tokio::time::Instant::now();
        let events = h.run_observed(id).await;

        assert!(retrying(&events).is_empty());
        assert!(started.elapsed() >= Duration::from_secs(80));
        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.text, "one two three four");
        assert_eq!(job.retries, 0);
        assert_eq!(h.adapter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_counts_as_transient() {
        let h = harness(
            vec![
                Script::Paced(vec!["too late".into()], Duration::from_secs(31)),
                Script::fragments(&["retried"]),
            ],
            MemoryHistory::default(),
        );
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(retrying(&events), vec![1]);
        assert_eq!(h.store.get(id).unwrap().text, "retried");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_drops_partial_text() {
        let scripts = (0..=CAP)
            .map(|_| {
                Script::Stream(vec![
                    Ok("partial".to_string()),
                    Err(ProviderError::Transient("stream reset".into())),
                ])
            })
            .collect();
        let h = harness(scripts, MemoryHistory::default());
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert!(matches!(events.last(), Some(StreamEvent::Failed { retryable: true, .. })));

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, CAP);
        assert!(job.text.is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_is_only_a_warning() {
        let h = harness(vec![Script::fragments(&["Hi"])], MemoryHistory::failing());
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], StreamEvent::Warning { .. }));
        assert_eq!(events[2], StreamEvent::Completed { total_length: 2, text: None });

        assert_eq!(h.store.get(id).unwrap().status, JobStatus::Completed);
        assert_eq!(h.history.append_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_reply_completes_without_saving() {
        let h = harness(vec![Script::fragments(&["", ""])], MemoryHistory::default());
        let id = h.submit("hello");

        let events = h.run_observed(id).await;
        assert_eq!(events, vec![StreamEvent::Completed { total_length: 0, text: None }]);
        assert_eq!(h.store.get(id).unwrap().status, JobStatus::Completed);
        assert_eq!(h.history.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_runs_to_completion_without_observers() {
        let h = harness(vec![Script::fragments(&["unseen"])], MemoryHistory::default());
        let id = h.submit("hello");

        h.executor.spawn(id).await.unwrap();

        assert_eq!(h.store.get(id).unwrap().status, JobStatus::Completed);
        assert_eq!(h.history.turns("conv-1").len(), 2);
        assert_eq!(h.bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_job_runs_only_once() {
        let h = harness(vec![Script::fragments(&["once"])], MemoryHistory::default());
        let id = h.submit("hello");

        h.executor.run(id).await;
        h.executor.run(id).await;

        assert_eq!(h.adapter.calls(), 1);
        assert_eq!(h.history.append_calls(), 1);
    }
}
