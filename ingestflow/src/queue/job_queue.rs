//! In-memory job queue with optional write-through persistence.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::job::{
    ChildFailurePolicy, ChildOutcome, Job, JobCounts, JobHandle, JobOptions, JobState, RepeatOptions,
};
use super::registry::JobPayload;
use super::repeat::{self, RepeatDefinition};
use super::store::JobStore;
use crate::config::JobQueueConfig;
use crate::events::{EventBus, JobEvent};
use crate::flow::ChildrenValues;
use crate::progress::JobProgress;
use crate::{Error, Result};

/// Claim order bookkeeping. Entries may be stale; the job record is always
/// re-checked before a claim.
#[derive(Default)]
struct QueueIndex {
    /// FIFO of claimable job ids per queue.
    waiting: HashMap<String, VecDeque<String>>,
    /// `(run_at_ms, job_id)` of delayed jobs.
    delayed: BTreeSet<(i64, String)>,
}

/// The job queue service.
///
/// Owns every job state transition. Lock order is job entry before index;
/// no job entry guard is held across an `.await` or while touching another job.
pub struct JobQueue {
    config: JobQueueConfig,
    /// Authoritative job records.
    jobs: DashMap<String, Job>,
    index: Mutex<QueueIndex>,
    repeats: DashMap<String, RepeatDefinition>,
    /// Serializes store writes per job id.
    persist_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Notify when jobs become claimable.
    notify: Arc<Notify>,
    events: EventBus,
    store: Option<Arc<dyn JobStore>>,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig, events: EventBus) -> Self {
        Self {
            config,
            jobs: DashMap::new(),
            index: Mutex::new(QueueIndex::default()),
            repeats: DashMap::new(),
            persist_locks: DashMap::new(),
            notify: Arc::new(Notify::new()),
            events,
            store: None,
        }
    }

    /// Create a queue that writes every transition through to `store`.
    pub fn with_store(config: JobQueueConfig, events: EventBus, store: Arc<dyn JobStore>) -> Self {
        let mut queue = Self::new(config, events);
        queue.store = Some(store);
        queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Notifier woken whenever a job becomes claimable.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Enqueue a job on `P::QUEUE`.
    ///
    /// With an explicit `job_id` that already exists the existing job is
    /// returned untouched (`created == false`), unless `unique` is set and that
    /// job has not finished, which fails with `DuplicateJob`. With `repeat` set
    /// the call upserts a repeatable definition instead.
    pub async fn enqueue<P: JobPayload>(
        &self,
        name: &str,
        payload: &P,
        options: JobOptions,
    ) -> Result<JobHandle> {
        payload
            .validate()
            .map_err(|e| Error::invalid_payload(P::QUEUE, e.to_string()))?;
        let value = serde_json::to_value(payload)
            .map_err(|e| Error::invalid_payload(P::QUEUE, e.to_string()))?;

        if options.repeat.is_some() {
            return self.upsert_repeatable(P::QUEUE, name, value, &options).await;
        }

        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job = self.build_job(&id, P::QUEUE, name, value, &options);

        let job = match self.jobs.entry(id.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if options.unique && !existing.state.is_terminal() {
                    return Err(Error::DuplicateJob(id));
                }
                debug!(job_id = %id, "Job already exists, returning existing handle");
                return Ok(existing.handle(false));
            }
            Entry::Vacant(slot) => slot.insert(job).clone(),
        };

        self.index_claimable(&job);
        self.persist(&job).await;
        self.announce(&job);

        info!(job_id = %job.id, queue = %job.queue, name = %job.name, "Enqueued job");
        Ok(job.handle(true))
    }

    /// Build a job record from options and queue defaults.
    pub(crate) fn build_job(
        &self,
        id: &str,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Job {
        let mut job = Job::new(
            id,
            queue,
            name,
            payload,
            options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            options
                .backoff
                .clone()
                .unwrap_or_else(|| self.config.default_backoff.clone()),
        );
        job.timeout_secs = options.timeout_secs;
        if let Some(delay_ms) = options.delay_ms.filter(|d| *d > 0) {
            job.state = JobState::Delayed;
            job.run_at = Some(Utc::now() + chrono::Duration::milliseconds(delay_ms as i64));
        }
        job
    }

    /// Insert the jobs of one flow tree, parent first. Nothing stays inserted
    /// if any id is taken.
    pub(crate) async fn insert_flow(&self, jobs: Vec<Job>) -> Result<()> {
        if let Some(taken) = jobs.iter().find(|j| self.jobs.contains_key(&j.id)) {
            return Err(Error::DuplicateJob(taken.id.clone()));
        }

        let mut inserted: Vec<Job> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let vacant = match self.jobs.entry(job.id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(job.clone());
                    true
                }
            };
            if !vacant {
                for done in &inserted {
                    self.jobs.remove(&done.id);
                }
                return Err(Error::DuplicateJob(job.id));
            }
            inserted.push(job);
        }

        for job in &inserted {
            self.index_claimable(job);
            self.persist(job).await;
            self.announce(job);
        }
        Ok(())
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    // ========================================================================
    // Claim and settle
    // ========================================================================

    /// Claim the next claimable job of `queue`, promoting due delayed jobs first.
    pub async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        self.promote_due().await;

        loop {
            let id = {
                let mut index = self.index.lock();
                match index.waiting.get_mut(queue).and_then(|q| q.pop_front()) {
                    Some(id) => id,
                    None => return Ok(None),
                }
            };

            // Re-check: the job may have been removed or already claimed.
            let job = {
                let Some(mut job) = self.jobs.get_mut(&id) else {
                    continue;
                };
                if job.state != JobState::Waiting {
                    continue;
                }
                job.state = JobState::Active;
                job.attempts_made = job.attempts_made.saturating_add(1);
                job.processed_at = Some(Utc::now());
                job.clone()
            };

            self.persist(&job).await;
            self.events.publish(JobEvent::Active {
                job_id: job.id.clone(),
                queue: job.queue.clone(),
                attempt: job.attempts_made,
            });
            debug!(job_id = %job.id, queue = %queue, attempt = job.attempts_made, "Claimed job");
            return Ok(Some(job));
        }
    }

    /// Mark an active job as completed with its return value.
    pub async fn complete(&self, job_id: &str, return_value: serde_json::Value) -> Result<()> {
        let job = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            if job.state != JobState::Active {
                return Err(Error::invalid_transition(job.state, JobState::Completed));
            }
            job.state = JobState::Completed;
            job.return_value = Some(return_value);
            job.failed_reason = None;
            job.error_kind = None;
            job.finished_at = Some(Utc::now());
            job.clone()
        };

        self.persist(&job).await;
        self.events.publish(JobEvent::Completed {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            return_value: job.return_value.clone().unwrap_or_default(),
        });
        info!(job_id = %job.id, queue = %job.queue, "Job completed");

        let outcome = ChildOutcome::Completed(job.return_value.clone().unwrap_or_default());
        self.after_terminal(&job, outcome).await;
        Ok(())
    }

    /// Record a failed attempt of an active job.
    ///
    /// Retryable errors reschedule the job with backoff while attempts remain;
    /// everything else is terminal. Returns the resulting state.
    pub async fn fail(&self, job_id: &str, error: &Error) -> Result<JobState> {
        let reason = error.to_string();
        let kind = error.kind();

        let job = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            if job.state != JobState::Active {
                return Err(Error::invalid_transition(job.state, JobState::Failed));
            }

            let will_retry = kind.should_retry() && job.attempts_made < job.max_attempts;
            job.failed_reason = Some(reason.clone());
            job.error_kind = Some(kind);

            if will_retry {
                let delay = job.backoff.delay_for_attempt(job.attempts_made);
                if delay.is_zero() {
                    job.state = JobState::Waiting;
                } else {
                    job.state = JobState::Delayed;
                    job.run_at = Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                }
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(Utc::now());
            }
            job.clone()
        };

        self.index_claimable(&job);
        self.persist(&job).await;

        let terminal = job.state == JobState::Failed;
        self.events.publish(JobEvent::Failed {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            reason: reason.clone(),
            error_kind: kind,
            attempts_made: job.attempts_made,
            will_retry: !terminal,
        });

        if terminal {
            warn!(
                job_id = %job.id,
                queue = %job.queue,
                attempts = job.attempts_made,
                error = %reason,
                "Job failed"
            );
            self.after_terminal(&job, ChildOutcome::Failed(reason)).await;
        } else {
            info!(
                job_id = %job.id,
                queue = %job.queue,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                error = %reason,
                "Job attempt failed, retrying"
            );
            self.announce(&job);
        }

        Ok(job.state)
    }

    /// Put an active job back to waiting without consuming its attempt.
    /// Used when a worker shuts down mid-job.
    pub async fn requeue_interrupted(&self, job_id: &str) -> Result<()> {
        let job = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            if job.state != JobState::Active {
                return Err(Error::invalid_transition(job.state, JobState::Waiting));
            }
            job.state = JobState::Waiting;
            job.attempts_made = job.attempts_made.saturating_sub(1);
            job.clone()
        };

        self.index_claimable(&job);
        self.persist(&job).await;
        self.announce(&job);
        info!(job_id = %job_id, "Requeued interrupted job");
        Ok(())
    }

    /// Set the progress of an active job and emit a progress event.
    pub async fn update_progress(&self, job_id: &str, progress: JobProgress) -> Result<()> {
        let job = {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("job", job_id))?;
            if job.state != JobState::Active {
                return Err(Error::validation(format!(
                    "progress of job {} can only be updated while active (state: {})",
                    job_id, job.state
                )));
            }
            job.progress = progress;
            job.clone()
        };

        self.persist(&job).await;
        self.events.publish(JobEvent::Progress {
            job_id: job.id,
            queue: job.queue,
            progress: job.progress,
        });
        Ok(())
    }

    async fn after_terminal(&self, job: &Job, outcome: ChildOutcome) {
        if job.parent.is_some() {
            self.settle_child(job, outcome).await;
        }
        if job.repeat.is_some() {
            self.schedule_next_repeat(job).await;
        }
    }

    /// Record a child's terminal outcome on its parent, releasing or failing
    /// the parent. Failures cascade up the tree under `FailParent`.
    async fn settle_child(&self, child: &Job, outcome: ChildOutcome) {
        let mut next = child.parent.clone().map(|p| (p.id, child.id.clone(), outcome));

        while let Some((parent_id, child_id, outcome)) = next.take() {
            let parent = {
                let Some(mut parent) = self.jobs.get_mut(&parent_id) else {
                    warn!(job_id = %parent_id, child_id = %child_id, "Parent job is gone");
                    break;
                };
                if parent.state != JobState::WaitingChildren {
                    debug!(job_id = %parent_id, state = %parent.state, "Parent no longer waits for children");
                    break;
                }

                let Some(child_ref) = parent.children.iter_mut().find(|c| c.job_id == child_id) else {
                    warn!(job_id = %parent_id, child_id = %child_id, "Child is not tracked by its parent");
                    break;
                };
                child_ref.outcome = Some(outcome);
                resolve_children(&mut parent);
                parent.clone()
            };

            self.index_claimable(&parent);
            self.persist(&parent).await;

            match parent.state {
                JobState::Waiting => {
                    debug!(job_id = %parent.id, "All children settled, parent is claimable");
                    self.announce(&parent);
                }
                JobState::Failed => {
                    let reason = parent.failed_reason.clone().unwrap_or_default();
                    warn!(job_id = %parent.id, error = %reason, "Flow parent failed because of a child");
                    self.events.publish(JobEvent::Failed {
                        job_id: parent.id.clone(),
                        queue: parent.queue.clone(),
                        reason: reason.clone(),
                        error_kind: parent.error_kind.unwrap_or(crate::error::ErrorKind::Validation),
                        attempts_made: parent.attempts_made,
                        will_retry: false,
                    });
                    next = parent
                        .parent
                        .clone()
                        .map(|p| (p.id, parent.id.clone(), ChildOutcome::Failed(reason)));
                }
                _ => {}
            }
        }
    }

    /// Move due delayed jobs to their waiting lists.
    async fn promote_due(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = {
            let mut index = self.index.lock();
            let mut due = Vec::new();
            loop {
                match index.delayed.first() {
                    Some((at, _)) if *at <= now_ms => {}
                    _ => break,
                }
                if let Some((_, id)) = index.delayed.pop_first() {
                    due.push(id);
                }
            }
            due
        };

        for id in due {
            let job = {
                let Some(mut job) = self.jobs.get_mut(&id) else {
                    continue;
                };
                if job.state != JobState::Delayed {
                    continue;
                }
                job.state = JobState::Waiting;
                job.clone()
            };
            self.index_claimable(&job);
            self.persist(&job).await;
            self.announce(&job);
        }
    }

    fn index_claimable(&self, job: &Job) {
        match job.state {
            JobState::Waiting => {
                self.index
                    .lock()
                    .waiting
                    .entry(job.queue.clone())
                    .or_default()
                    .push_back(job.id.clone());
                self.notify.notify_waiters();
            }
            JobState::Delayed => {
                let at = job.run_at.map(|t| t.timestamp_millis()).unwrap_or(0);
                self.index.lock().delayed.insert((at, job.id.clone()));
            }
            _ => {}
        }
    }

    fn announce(&self, job: &Job) {
        match job.state {
            JobState::Waiting => self.events.publish(JobEvent::Waiting {
                job_id: job.id.clone(),
                queue: job.queue.clone(),
                name: job.name.clone(),
            }),
            JobState::Delayed => {
                let delay_ms = job
                    .run_at
                    .map(|t| (t - Utc::now()).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                self.events.publish(JobEvent::Delayed {
                    job_id: job.id.clone(),
                    queue: job.queue.clone(),
                    delay_ms,
                });
            }
            _ => {}
        }
    }

    /// Write the current record of `job.id` through to the store.
    ///
    /// Writes of one id are serialized and each saves the record as it is once
    /// the write lock is held, so the last write to land always carries the
    /// latest transition. A job that is gone from memory is not written.
    async fn persist(&self, job: &Job) {
        let Some(store) = &self.store else {
            return;
        };
        let lock = self.persist_lock(&job.id);
        let _guard = lock.lock().await;

        let Some(current) = self.get_job(&job.id) else {
            return;
        };
        if let Err(e) = store.save_job(&current).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist job");
        }
    }

    fn persist_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.persist_locks.entry(id.to_string()).or_default().clone()
    }

    async fn forget(&self, job: &Job) {
        if let Some(store) = &self.store {
            let lock = self.persist_lock(&job.id);
            let guard = lock.lock().await;
            if let Err(e) = store.delete_job(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to delete persisted job");
            }
            drop(guard);
            self.persist_locks.remove(&job.id);
        }
        self.events.publish(JobEvent::Removed {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
        });
    }

    // ========================================================================
    // Lookup and introspection
    // ========================================================================

    /// Get a job by ID.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|job| job.clone())
    }

    /// Settled results of a job's direct flow children.
    pub fn children_values(&self, id: &str) -> Result<ChildrenValues> {
        let job = self.get_job(id).ok_or_else(|| Error::not_found("job", id))?;
        Ok(ChildrenValues::from_refs(&job.children))
    }

    /// Resolve once the job reaches `completed` or `failed`.
    pub async fn wait_until_finished(&self, id: &str, timeout: Duration) -> Result<Job> {
        // Subscribe before reading so a transition in between is not missed.
        let mut subscription = self.events.subscribe_job(id);

        let wait = async {
            loop {
                match self.get_job(id) {
                    None => return Err(Error::not_found("job", id)),
                    Some(job) if job.is_finished() => return Ok(job),
                    Some(_) => {}
                }
                if subscription.recv().await.is_none() {
                    return Err(Error::Other("event bus closed".to_string()));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("waiting for job {}", id),
                after: timeout,
            })?
    }

    /// Number of jobs per state across all queues.
    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.iter() {
            counts.add(job.state);
        }
        counts
    }

    /// Number of jobs per state in one queue.
    pub fn queue_counts(&self, queue: &str) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.iter().filter(|j| j.queue == queue) {
            counts.add(job.state);
        }
        counts
    }

    /// Jobs filtered by queue and state, oldest first.
    pub fn list_jobs(&self, queue: Option<&str>, state: Option<JobState>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| queue.is_none_or(|q| j.queue == q))
            .filter(|j| state.is_none_or(|s| j.state == s))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Remove a finished job.
    pub async fn remove_job(&self, id: &str) -> Result<Job> {
        let state = self
            .jobs
            .get(id)
            .map(|j| j.state)
            .ok_or_else(|| Error::not_found("job", id))?;
        let (_, job) = self
            .jobs
            .remove_if(id, |_, j| j.state.is_terminal())
            .ok_or_else(|| Error::invalid_transition(state, "removed"))?;

        self.forget(&job).await;
        info!(job_id = %id, "Removed job");
        Ok(job)
    }

    /// Purge finished jobs that finished more than `older_than` ago.
    pub async fn clean(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::validation(format!("invalid retention: {}", e)))?;

        let ids: Vec<String> = self
            .jobs
            .iter()
            .filter(|j| j.state.is_terminal() && j.finished_at.is_some_and(|at| at <= cutoff))
            .map(|j| j.id.clone())
            .collect();

        let mut removed = 0;
        for id in ids {
            if let Some((_, job)) = self.jobs.remove_if(&id, |_, j| j.state.is_terminal()) {
                self.forget(&job).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(count = removed, "Cleaned finished jobs");
        }
        Ok(removed)
    }

    /// Reload jobs and repeat definitions from the store.
    ///
    /// Active jobs were interrupted by the restart and go back to waiting.
    /// Parents still waiting for children are settled against their children's
    /// stored states. Call before workers start. Returns the number of
    /// unfinished jobs loaded.
    pub async fn recover(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut jobs = store.load_jobs().await?;
        jobs.sort_by_key(|j| j.created_at);

        let mut order = Vec::with_capacity(jobs.len());
        let mut dirty = Vec::new();
        for mut job in jobs {
            if job.state == JobState::Active {
                job.state = JobState::Waiting;
                dirty.push(job.id.clone());
            }
            order.push(job.id.clone());
            self.jobs.insert(job.id.clone(), job);
        }
        let interrupted = dirty.len();

        let reconciled = self.reconcile_parents();
        for id in &reconciled {
            if !dirty.contains(id) {
                dirty.push(id.clone());
            }
        }
        for id in &dirty {
            if let Some(job) = self.get_job(id) {
                self.persist(&job).await;
            }
        }

        let mut unfinished = 0;
        for id in &order {
            let Some(job) = self.get_job(id) else {
                continue;
            };
            if !job.state.is_terminal() {
                unfinished += 1;
            }
            self.index_claimable(&job);
        }

        for def in store.load_repeats().await? {
            self.repeats.insert(def.key.clone(), def);
        }

        info!(
            unfinished,
            interrupted,
            reconciled = reconciled.len(),
            repeats = self.repeats.len(),
            "Recovered jobs from store"
        );
        Ok(unfinished)
    }

    /// Fill in child outcomes of `waiting-children` parents from the loaded
    /// children and release or fail the parents that are now settled. Repeats
    /// until nothing changes so failures climb nested flows. Returns the ids
    /// of parents whose record changed.
    fn reconcile_parents(&self) -> Vec<String> {
        let mut changed: Vec<String> = Vec::new();
        loop {
            let parents: Vec<(String, Vec<String>)> = self
                .jobs
                .iter()
                .filter(|j| j.state == JobState::WaitingChildren)
                .map(|j| {
                    let pending = j
                        .children
                        .iter()
                        .filter(|c| c.outcome.is_none())
                        .map(|c| c.job_id.clone())
                        .collect();
                    (j.id.clone(), pending)
                })
                .collect();

            let mut progressed = false;
            for (parent_id, pending) in parents {
                let settled: Vec<(String, ChildOutcome)> = pending
                    .into_iter()
                    .filter_map(|id| self.stored_outcome(&id).map(|o| (id, o)))
                    .collect();

                let Some(mut parent) = self.jobs.get_mut(&parent_id) else {
                    continue;
                };
                let mut touched = false;
                for (child_id, outcome) in settled {
                    if let Some(child) = parent.children.iter_mut().find(|c| c.job_id == child_id) {
                        child.outcome = Some(outcome);
                        touched = true;
                    }
                }
                let released = resolve_children(&mut parent);
                if released {
                    debug!(job_id = %parent_id, state = %parent.state, "Settled parent during recovery");
                    progressed = true;
                }
                if (touched || released) && !changed.contains(&parent_id) {
                    changed.push(parent_id);
                }
            }

            if !progressed {
                return changed;
            }
        }
    }

    /// Terminal outcome of a loaded child, `None` while it is still pending.
    fn stored_outcome(&self, child_id: &str) -> Option<ChildOutcome> {
        let Some(child) = self.jobs.get(child_id) else {
            return Some(ChildOutcome::Failed(format!("child job {} is missing", child_id)));
        };
        match child.state {
            JobState::Completed => Some(ChildOutcome::Completed(
                child.return_value.clone().unwrap_or_default(),
            )),
            JobState::Failed => Some(ChildOutcome::Failed(
                child.failed_reason.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    // ========================================================================
    // Repeatable jobs
    // ========================================================================

    async fn upsert_repeatable(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobHandle> {
        let Some(repeat) = options.repeat.clone() else {
            return Err(Error::validation("repeat options missing"));
        };
        let next_at = repeat::next_run(&repeat.pattern, Utc::now())?;
        let template = self.build_job("", queue, name, payload.clone(), options);

        let (handle, scheduled, replaced, def) = {
            let mut def = self
                .repeats
                .entry(repeat.key.clone())
                .or_insert_with(|| RepeatDefinition {
                    key: repeat.key.clone(),
                    queue: queue.to_string(),
                    name: name.to_string(),
                    pattern: repeat.pattern.clone(),
                    payload: payload.clone(),
                    max_attempts: template.max_attempts,
                    backoff: template.backoff.clone(),
                    timeout_secs: template.timeout_secs,
                    next_job_id: None,
                    created_at: Utc::now(),
                });

            let pattern_changed = def.pattern != repeat.pattern;
            def.queue = queue.to_string();
            def.name = name.to_string();
            def.pattern = repeat.pattern.clone();
            def.payload = payload;
            def.max_attempts = template.max_attempts;
            def.backoff = template.backoff.clone();
            def.timeout_secs = template.timeout_secs;

            let pending = def
                .next_job_id
                .as_ref()
                .and_then(|id| self.jobs.get(id).map(|j| (j.id.clone(), j.state, j.handle(false))));

            let mut replaced = None;
            let existing = match pending {
                Some((id, JobState::Delayed, _)) if pattern_changed => {
                    replaced = self
                        .jobs
                        .remove_if(&id, |_, j| j.state == JobState::Delayed)
                        .map(|(_, job)| job);
                    if replaced.is_some() {
                        None
                    } else {
                        self.jobs.get(&id).map(|j| j.handle(false))
                    }
                }
                Some((_, state, handle)) if !state.is_terminal() => Some(handle),
                _ => None,
            };

            match existing {
                Some(handle) => (handle, None, replaced, def.clone()),
                None => {
                    let mut job = self.repeat_instance(&def, next_at);
                    job.repeat = Some(repeat.clone());
                    let created = match self.jobs.entry(job.id.clone()) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(slot) => {
                            slot.insert(job.clone());
                            true
                        }
                    };
                    def.next_job_id = Some(job.id.clone());
                    let handle = job.handle(created);
                    (handle, created.then_some(job), replaced, def.clone())
                }
            }
        };

        if let Some(old) = &replaced {
            self.forget(old).await;
        }
        if let Some(job) = &scheduled {
            self.index_claimable(job);
            self.persist(job).await;
            self.announce(job);
        }
        self.persist_repeat(&def).await;

        info!(
            key = %def.key,
            pattern = %def.pattern,
            next_job_id = ?def.next_job_id,
            "Upserted repeatable job"
        );
        Ok(handle)
    }

    fn repeat_instance(&self, def: &RepeatDefinition, run_at: chrono::DateTime<Utc>) -> Job {
        let mut job = Job::new(
            repeat::instance_id(&def.key, run_at),
            &def.queue,
            &def.name,
            def.payload.clone(),
            def.max_attempts,
            def.backoff.clone(),
        );
        job.timeout_secs = def.timeout_secs;
        job.state = JobState::Delayed;
        job.run_at = Some(run_at);
        job
    }

    async fn schedule_next_repeat(&self, finished: &Job) {
        let Some(repeat) = &finished.repeat else {
            return;
        };

        let scheduled = {
            let Some(mut def) = self.repeats.get_mut(&repeat.key) else {
                debug!(key = %repeat.key, "Repeat definition removed, not scheduling successor");
                return;
            };
            if def.next_job_id.as_deref() != Some(finished.id.as_str()) {
                return;
            }

            let after = finished.run_at.map_or(Utc::now(), |at| at.max(Utc::now()));
            let next_at = match repeat::next_run(&def.pattern, after) {
                Ok(at) => at,
                Err(e) => {
                    warn!(key = %def.key, error = %e, "Cannot schedule next repeat instance");
                    def.next_job_id = None;
                    return;
                }
            };

            let mut job = self.repeat_instance(&def, next_at);
            job.repeat = Some(RepeatOptions::new(def.key.clone(), def.pattern.clone()));
            if self.jobs.contains_key(&job.id) {
                return;
            }
            self.jobs.insert(job.id.clone(), job.clone());
            def.next_job_id = Some(job.id.clone());
            (job, def.clone())
        };

        let (job, def) = scheduled;
        self.index_claimable(&job);
        self.persist(&job).await;
        self.persist_repeat(&def).await;
        self.announce(&job);
        debug!(key = %def.key, job_id = %job.id, "Scheduled next repeat instance");
    }

    /// Delete a repeat definition and its not-yet-started instance. A running
    /// instance finishes but schedules no successor.
    pub async fn remove_repeatable(&self, key: &str) -> Result<bool> {
        let Some((_, def)) = self.repeats.remove(key) else {
            return Ok(false);
        };

        if let Some(id) = &def.next_job_id
            && let Some((_, job)) = self.jobs.remove_if(id, |_, j| {
                matches!(j.state, JobState::Delayed | JobState::Waiting)
            })
        {
            self.forget(&job).await;
        }

        if let Some(store) = &self.store
            && let Err(e) = store.delete_repeat(key).await
        {
            warn!(key = %key, error = %e, "Failed to delete persisted repeat definition");
        }

        info!(key = %key, "Removed repeatable job");
        Ok(true)
    }

    /// Registered repeat definitions, sorted by key.
    pub fn repeatable_jobs(&self) -> Vec<RepeatDefinition> {
        let mut defs: Vec<RepeatDefinition> = self.repeats.iter().map(|d| d.clone()).collect();
        defs.sort_by(|a, b| a.key.cmp(&b.key));
        defs
    }

    async fn persist_repeat(&self, def: &RepeatDefinition) {
        if let Some(store) = &self.store
            && let Err(e) = store.save_repeat(def).await
        {
            warn!(key = %def.key, error = %e, "Failed to persist repeat definition");
        }
    }
}

/// Release or fail a `waiting-children` parent from its recorded child
/// outcomes. Returns whether the parent left `waiting-children`.
fn resolve_children(parent: &mut Job) -> bool {
    if parent.state != JobState::WaitingChildren {
        return false;
    }

    let failed = match parent.child_failure {
        ChildFailurePolicy::FailParent => parent.children.iter().find_map(|c| match &c.outcome {
            Some(ChildOutcome::Failed(reason)) => Some((c.key.clone(), reason.clone())),
            _ => None,
        }),
        ChildFailurePolicy::Report => None,
    };

    if let Some((key, reason)) = failed {
        let error = Error::ChildFailed { key, reason };
        parent.state = JobState::Failed;
        parent.failed_reason = Some(error.to_string());
        parent.error_kind = Some(error.kind());
        parent.finished_at = Some(Utc::now());
        true
    } else if parent.children.iter().all(|c| c.outcome.is_some()) {
        parent.state = JobState::Waiting;
        true
    } else {
        false
    }
}
