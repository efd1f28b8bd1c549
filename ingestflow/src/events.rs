//! In-process event bus for job lifecycle events.
//!
//! Every event goes to a global channel (telemetry, logs) and to the topic of
//! the job it concerns. Per-job topics exist only while someone listens.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::progress::JobProgress;

/// Job lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job became claimable.
    Waiting {
        job_id: String,
        queue: String,
        name: String,
    },
    /// A job was scheduled for later (retry backoff or repeat instance).
    Delayed {
        job_id: String,
        queue: String,
        delay_ms: u64,
    },
    /// A worker claimed the job.
    Active {
        job_id: String,
        queue: String,
        attempt: u32,
    },
    Progress {
        job_id: String,
        queue: String,
        progress: JobProgress,
    },
    Completed {
        job_id: String,
        queue: String,
        return_value: serde_json::Value,
    },
    /// An attempt failed. `will_retry` is false when the failure is terminal.
    Failed {
        job_id: String,
        queue: String,
        reason: String,
        error_kind: ErrorKind,
        attempts_made: u32,
        will_retry: bool,
    },
    Removed {
        job_id: String,
        queue: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Waiting { job_id, .. }
            | JobEvent::Delayed { job_id, .. }
            | JobEvent::Active { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Removed { job_id, .. } => job_id,
        }
    }

    /// Whether no further lifecycle event follows for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. }
                | JobEvent::Failed {
                    will_retry: false,
                    ..
                }
                | JobEvent::Removed { .. }
        )
    }
}

struct BusInner {
    global: broadcast::Sender<JobEvent>,
    topics: RwLock<HashMap<String, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

/// Topic-keyed broadcast hub for [`JobEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                global,
                topics: RwLock::new(HashMap::new()),
                capacity,
            }),
        }
    }

    /// Publish an event. No-op for channels without receivers.
    pub fn publish(&self, event: JobEvent) {
        {
            let topics = self.inner.topics.read();
            if let Some(tx) = topics.get(event.job_id()) {
                let _ = tx.send(event.clone());
            }
        }
        let _ = self.inner.global.send(event);
    }

    /// Receive every event published on the bus.
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.global.subscribe()
    }

    /// Receive the events of one job until the subscription is dropped.
    pub fn subscribe_job(&self, job_id: &str) -> JobSubscription {
        let rx = {
            let mut topics = self.inner.topics.write();
            topics
                .entry(job_id.to_string())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        debug!(job_id = %job_id, "Subscribed to job events");
        JobSubscription {
            job_id: job_id.to_string(),
            rx: Some(rx),
            bus: self.inner.clone(),
        }
    }

    /// Number of per-job topics with live registrations.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.read().len()
    }

    /// Number of listeners registered on one job's topic.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::EventBusConfig::default().capacity)
    }
}

/// Registration on one job's topic. Dropping it unsubscribes.
pub struct JobSubscription {
    job_id: String,
    rx: Option<broadcast::Receiver<JobEvent>>,
    bus: Arc<BusInner>,
}

impl JobSubscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next event for this job. `None` once the bus is gone.
    ///
    /// Lagged receivers skip the overwritten events and keep going.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job_id = %self.job_id, skipped, "Job event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive events until a terminal one arrives, returning it.
    pub async fn until_terminal(&mut self) -> Option<JobEvent> {
        while let Some(event) = self.recv().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }

    pub fn unsubscribe(self) {}
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        let mut topics = self.bus.topics.write();
        if topics
            .get(&self.job_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            topics.remove(&self.job_id);
            debug!(job_id = %self.job_id, "Removed job event topic");
        }
    }
}
