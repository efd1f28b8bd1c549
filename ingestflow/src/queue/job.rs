//! Job record and the options it is enqueued with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::progress::JobProgress;
use crate::resilience::BackoffPolicy;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Claimable by a worker.
    Waiting,
    /// Claimable once `run_at` passes.
    Delayed,
    /// Flow parent whose children have not all settled.
    WaitingChildren,
    /// Claimed by a worker.
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::WaitingChildren => "waiting-children",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a flow parent does when one of its children fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildFailurePolicy {
    /// Fail the parent (and, transitively, its ancestors) without running it.
    #[default]
    FailParent,
    /// Run the parent once every child settled and expose the failure in its
    /// children values.
    Report,
}

/// Cron-driven repeat schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Identity of the recurring job. Upserting the same key never creates a
    /// second schedule.
    pub key: String,
    /// Six-field cron pattern, seconds first (`0 15 3 * * *`).
    pub pattern: String,
}

impl RepeatOptions {
    pub fn new(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
        }
    }
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Explicit id. Enqueueing an id that already exists returns the existing job.
    pub job_id: Option<String>,
    /// Fail with `DuplicateJob` instead when the existing job is not terminal.
    #[serde(default)]
    pub unique: bool,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    /// Initial delay in milliseconds.
    pub delay_ms: Option<u64>,
    /// Per-attempt timeout overriding the worker pool default.
    pub timeout_secs: Option<u64>,
    pub repeat: Option<RepeatOptions>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }
}

/// Link from a flow child to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
    pub queue: String,
}

/// Settled result of a flow child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ChildOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

/// Link from a flow parent to one of its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    /// Queue-qualified name, `queue:name`.
    pub key: String,
    pub job_id: String,
    /// Set once the child reaches a terminal state.
    pub outcome: Option<ChildOutcome>,
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    #[serde(default)]
    pub progress: JobProgress,
    pub return_value: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_secs: Option<u64>,
    pub repeat: Option<RepeatOptions>,
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub children: Vec<ChildRef>,
    #[serde(default)]
    pub child_failure: ChildFailurePolicy,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes claimable.
    pub run_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh job in the `waiting` state.
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            name: name.into(),
            payload,
            state: JobState::Waiting,
            progress: JobProgress::default(),
            return_value: None,
            failed_reason: None,
            error_kind: None,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            backoff,
            timeout_secs: None,
            repeat: None,
            parent: None,
            children: Vec::new(),
            child_failure: ChildFailurePolicy::default(),
            created_at: Utc::now(),
            run_at: None,
            processed_at: None,
            finished_at: None,
        }
    }

    /// Queue-qualified name used as the key in a parent's children values.
    pub fn key(&self) -> String {
        format!("{}:{}", self.queue, self.name)
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn handle(&self, created: bool) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            queue: self.queue.clone(),
            name: self.name.clone(),
            created,
        }
    }
}

/// Returned by enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    pub name: String,
    /// False when an existing job with the same id was returned.
    pub created: bool,
}

/// Number of jobs per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub waiting_children: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub(crate) fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::WaitingChildren => self.waiting_children += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting
            + self.delayed
            + self.waiting_children
            + self.active
            + self.completed
            + self.failed
    }
}
