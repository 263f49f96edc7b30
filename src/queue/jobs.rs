//! Job Store
//!
//! Process-wide registry of generation jobs. Each job sits behind its own
//! lock: the executor holds the write side only for the duration of a single
//! field update, and readers always receive a cloned snapshot, so no
//! observer ever sees a half-applied mutation.

use crate::queue::events::StreamEvent;
use crate::types::{ConversationTurn, Part};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses only move forward: pending -> processing -> completed | failed.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub error: String,
    pub retryable: bool,
}

/// Inputs captured at submission time; immutable for the job's lifetime.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub conversation_id: String,
    pub history: Vec<ConversationTurn>,
    pub message: Vec<Part>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "chatId")]
    pub conversation_id: String,
    pub status: JobStatus,
    pub model: String,
    #[serde(skip)]
    pub history: Arc<Vec<ConversationTurn>>,
    #[serde(skip)]
    pub message: Arc<Vec<Part>>,
    /// Text accumulated by the current attempt
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Retries spent after transient failures
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    finished: Option<Instant>,
}

impl Job {
    /// Terminal event reproducing the cached final state, for observers
    /// that attach after the job has finished.
    pub fn terminal_event(&self) -> Option<StreamEvent> {
        match self.status {
            JobStatus::Completed => Some(StreamEvent::Completed {
                total_length: self.text.chars().count(),
                text: Some(self.text.clone()),
            }),
            JobStatus::Failed => {
                let failure = self.failure.clone().unwrap_or(JobFailure {
                    error: "generation failed".to_string(),
                    retryable: false,
                });
                Some(StreamEvent::Failed {
                    error: failure.error,
                    retryable: failure.retryable,
                })
            }
            JobStatus::Pending | JobStatus::Processing => None,
        }
    }
}

/// A requested status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Complete,
    Fail(JobFailure),
}

impl Transition {
    fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Processing,
            Transition::Complete => JobStatus::Completed,
            Transition::Fail(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Arc<RwLock<Job>>>>,
    retention: Duration,
}

impl JobStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Register a new pending job and return its id. Never blocks on I/O.
    pub fn create(&self, new_job: NewJob) -> JobId {
        let id = Uuid::new_v4();
        let job = Job {
            id,
            conversation_id: new_job.conversation_id,
            status: JobStatus::Pending,
            model: new_job.model,
            history: Arc::new(new_job.history),
            message: Arc::new(new_job.message),
            text: String::new(),
            failure: None,
            retries: 0,
            created_at: Utc::now(),
            finished_at: None,
            finished: None,
        };

        self.jobs.write().insert(id, Arc::new(RwLock::new(job)));
        debug!(job_id = %id, "Job created");
        id
    }

    /// Snapshot of a job, or `None` if unknown or already evicted.
    pub fn get(&self, id: JobId) -> Option<Job> {
        let entry = self.entry(id).ok()?;
        let job = entry.read().clone();
        Some(job)
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        let entry = self.entry(id).ok()?;
        let status = entry.read().status;
        Some(status)
    }

    /// Apply a status change. Anything other than a forward step along
    /// pending -> processing -> completed | failed is rejected and leaves the
    /// job untouched.
    pub fn transition(&self, id: JobId, transition: Transition) -> Result<(), JobStoreError> {
        let entry = self.entry(id)?;
        let mut job = entry.write();

        let to = transition.target();
        if !job.status.can_advance_to(to) {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }

        job.status = to;
        if let Transition::Fail(failure) = transition {
            // Partial text of the last attempt is never a result.
            job.text.clear();
            job.failure = Some(failure);
        }
        if to.is_terminal() {
            job.finished_at = Some(Utc::now());
            job.finished = Some(Instant::now());
        }
        Ok(())
    }

    /// Append a fragment to the text of a processing job.
    pub fn append_text(&self, id: JobId, fragment: &str) -> Result<(), JobStoreError> {
        let entry = self.entry(id)?;
        let mut job = entry.write();
        if job.status != JobStatus::Processing {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        job.text.push_str(fragment);
        Ok(())
    }

    /// Drop the text of a failed attempt and count the retry. Returns the
    /// retry count after the increment.
    pub fn discard_attempt(&self, id: JobId) -> Result<u32, JobStoreError> {
        let entry = self.entry(id)?;
        let mut job = entry.write();
        if job.status != JobStatus::Processing {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        job.text.clear();
        job.retries += 1;
        Ok(job.retries)
    }

    /// Evict jobs whose retention window has elapsed since they finished.
    /// Returns the evicted ids.
    pub fn garbage_collect(&self) -> Vec<JobId> {
        let now = Instant::now();
        let mut jobs = self.jobs.write();
        let mut evicted = Vec::new();

        jobs.retain(|id, entry| {
            let expired = entry
                .read()
                .finished
                .map(|at| now.saturating_duration_since(at) >= self.retention)
                .unwrap_or(false);
            if expired {
                evicted.push(*id);
            }
            !expired
        });

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), remaining = jobs.len(), "Evicted finished jobs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of jobs that have not yet finished
    pub fn active(&self) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|entry| !entry.read().status.is_terminal())
            .count()
    }

    fn entry(&self, id: JobId) -> Result<Arc<RwLock<Job>>, JobStoreError> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(JobStoreError::NotFound(id))
    }
}
