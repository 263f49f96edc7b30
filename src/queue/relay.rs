//! Stream Relay
//!
//! Turns a job id into the event feed for one observer. Running jobs are
//! followed live from the moment of attachment; finished jobs replay a
//! single synthesized terminal event built from the cached final state.

use crate::queue::bus::{EventBus, Subscription};
use crate::queue::events::StreamEvent;
use crate::queue::jobs::{JobId, JobStore, JobStoreError};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tracing::debug;

pub type EventStream = BoxStream<'static, StreamEvent>;

enum RelayState {
    Live {
        subscription: Subscription,
        store: Arc<JobStore>,
    },
    Done,
}

/// Attach an observer to `job_id`.
///
/// Dropping the returned stream detaches the observer without affecting the
/// job.
pub fn attach(store: &Arc<JobStore>, bus: &EventBus, job_id: JobId) -> Result<EventStream, JobStoreError> {
    // Subscribe before taking the snapshot: a job that finishes in between
    // is then seen as terminal here, and one that finishes later delivers
    // its terminal event through the subscription.
    let subscription = bus.subscribe(job_id);
    let job = store.get(job_id).ok_or(JobStoreError::NotFound(job_id))?;

    if let Some(event) = job.terminal_event() {
        debug!(job_id = %job_id, status = %job.status, "Replaying final state");
        drop(subscription);
        return Ok(stream::once(async move { event }).boxed());
    }

    debug!(job_id = %job_id, status = %job.status, "Following live job");
    let state = RelayState::Live {
        subscription,
        store: Arc::clone(store),
    };

    Ok(stream::unfold(state, |state| async move {
        match state {
            RelayState::Done => None,
            RelayState::Live {
                mut subscription,
                store,
            } => match subscription.recv().await {
                Some(event) => {
                    let next = if event.is_terminal() {
                        RelayState::Done
                    } else {
                        RelayState::Live { subscription, store }
                    };
                    Some((event, next))
                }
                // Channel closed without a terminal event reaching us, e.g. it
                // was skipped while lagging. Fall back to the snapshot.
                None => {
                    let job_id = subscription.job_id();
                    drop(subscription);
                    store
                        .get(job_id)
                        .and_then(|job| job.terminal_event())
                        .map(|event| (event, RelayState::Done))
                }
            },
        }
    })
    .boxed())
}
