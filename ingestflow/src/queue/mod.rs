//! Job queue module.
//!
//! This module provides the named work queues, the handler registry and the
//! worker pool that drives them.

pub mod job;
pub mod job_queue;
pub mod registry;
pub mod repeat;
pub mod store;
pub mod worker_pool;

pub use job::{
    ChildFailurePolicy, ChildOutcome, ChildRef, Job, JobCounts, JobHandle, JobOptions, JobState,
    ParentRef, RepeatOptions,
};
pub use job_queue::JobQueue;
pub use registry::{JobContext, JobHandler, JobPayload, QueueRegistry};
pub use repeat::RepeatDefinition;
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use worker_pool::WorkerPool;
