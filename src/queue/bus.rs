//! Event Bus
//!
//! Per-job fan-out built on `tokio::sync::broadcast`. Publishing never
//! waits: events sent while nobody is subscribed are dropped, and a
//! subscriber that falls more than the channel capacity behind skips the
//! oldest events instead of stalling the producer.

use crate::queue::events::StreamEvent;
use crate::queue::jobs::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<JobId, broadcast::Sender<StreamEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Deliver `event` to every subscriber currently attached to `job_id`.
    pub fn publish(&self, job_id: JobId, event: StreamEvent) {
        let channels = self.channels.lock();
        if let Some(sender) = channels.get(&job_id) {
            // Err only means every receiver is gone.
            let _ = sender.send(event);
        }
    }

    /// Attach a new observer to `job_id`.
    pub fn subscribe(&self, job_id: JobId) -> Subscription {
        let mut channels = self.channels.lock();
        let receiver = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription {
            job_id,
            receiver: Some(receiver),
            bus: self.clone(),
            finished: false,
        }
    }

    /// Drop the channel for a finished job. Subscribers drain what is already
    /// buffered and then see the end of their feed.
    pub fn close(&self, job_id: JobId) {
        if self.channels.lock().remove(&job_id).is_some() {
            debug!(job_id = %job_id, "Closed event channel");
        }
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels
            .lock()
            .get(&job_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn release(&self, job_id: JobId) {
        let mut channels = self.channels.lock();
        if channels
            .get(&job_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&job_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live feed of one job's events. Ends after the first terminal event or
/// when the job's channel is closed; dropping it detaches the observer.
pub struct Subscription {
    job_id: JobId,
    receiver: Option<broadcast::Receiver<StreamEvent>>,
    bus: EventBus,
    finished: bool,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Next event, or `None` once the feed is complete.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let receiver = self.receiver.as_mut()?;

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "Observer lagged, events skipped");
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Drop the receiver first so the count below no longer includes it.
        self.receiver.take();
        self.bus.release(self.job_id);
    }
}
