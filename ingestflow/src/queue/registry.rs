//! Handler registry.
//!
//! Maps queue names to handlers. Each handler declares the payload type it
//! consumes; the registry deserializes the stored JSON into that type before
//! the handler runs, so handlers never see an untyped blob.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use super::job::Job;
use super::job_queue::JobQueue;
use crate::flow::ChildrenValues;
use crate::progress::JobProgress;
use crate::{Error, Result};

/// Payload bound to exactly one queue.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue this payload is enqueued on.
    const QUEUE: &'static str;

    /// Reject payloads the handler cannot work with.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Business logic for one queue.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: JobPayload;
    type Output: Serialize + Send;

    async fn handle(&self, payload: Self::Payload, ctx: &JobContext) -> Result<Self::Output>;
}

/// What a handler sees of the job it runs.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    queue: Arc<JobQueue>,
}

impl JobContext {
    pub fn new(job: Job, queue: Arc<JobQueue>) -> Self {
        Self { job, queue }
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn job_name(&self) -> &str {
        &self.job.name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    /// Snapshot of the job as it was claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Report progress for this job and emit a progress event.
    pub async fn update_progress(&self, progress: impl Into<JobProgress>) -> Result<()> {
        self.queue.update_progress(&self.job.id, progress.into()).await
    }

    /// Settled results of this job's direct flow children.
    pub fn children_values(&self) -> Result<ChildrenValues> {
        self.queue.children_values(&self.job.id)
    }
}

/// Object-safe form of [`JobHandler`].
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn run(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value>;
}

struct TypedHandler<H>(H);

#[async_trait]
impl<H: JobHandler> ErasedHandler for TypedHandler<H> {
    async fn run(&self, job: &Job, ctx: &JobContext) -> Result<serde_json::Value> {
        let payload: H::Payload = serde_json::from_value(job.payload.clone())
            .map_err(|e| Error::invalid_payload(&job.queue, e.to_string()))?;
        payload
            .validate()
            .map_err(|e| Error::invalid_payload(&job.queue, e.to_string()))?;
        let output = self.0.handle(payload, ctx).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Explicit registry, built once at startup and shared by `Arc`.
#[derive(Default)]
pub struct QueueRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ErasedHandler>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `H::Payload::QUEUE`. One handler per queue.
    pub fn register<H: JobHandler>(&self, handler: H) -> Result<()> {
        let queue = <H::Payload as JobPayload>::QUEUE;
        let mut handlers = self.handlers.write();
        if handlers.contains_key(queue) {
            return Err(Error::DuplicateHandler(queue.to_string()));
        }
        handlers.insert(queue.to_string(), Arc::new(TypedHandler(handler)));
        info!(queue = %queue, "Registered job handler");
        Ok(())
    }

    pub fn is_registered(&self, queue: &str) -> bool {
        self.handlers.read().contains_key(queue)
    }

    /// Registered queue names, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.handlers.read().keys().cloned().collect();
        queues.sort();
        queues
    }

    pub(crate) fn get(&self, queue: &str) -> Result<Arc<dyn ErasedHandler>> {
        self.handlers
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))
    }
}
