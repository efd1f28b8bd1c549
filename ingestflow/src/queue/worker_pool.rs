//! Worker pool driving the registered queues.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::Job;
use super::job_queue::JobQueue;
use super::registry::{ErasedHandler, JobContext, QueueRegistry};
use crate::Error;
use crate::config::WorkerPoolConfig;

/// Runs `concurrency` workers per registered queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Jobs currently being processed.
    active_jobs: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_jobs: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn workers for every queue registered in `registry`.
    pub fn start(&self, job_queue: Arc<JobQueue>, registry: Arc<QueueRegistry>) {
        let queues = registry.queues();
        info!(
            queues = ?queues,
            concurrency = self.config.concurrency,
            "Starting worker pool"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Worker pool was already stopped, not starting workers");
            return;
        };

        for queue_name in queues {
            let handler = match registry.get(&queue_name) {
                Ok(h) => h,
                Err(e) => {
                    error!(queue = %queue_name, error = %e, "Handler vanished before start");
                    continue;
                }
            };

            for i in 0..self.config.concurrency {
                let worker = Worker {
                    id: i,
                    queue_name: queue_name.clone(),
                    handler: handler.clone(),
                    job_queue: job_queue.clone(),
                    cancellation_token: self.cancellation_token.clone(),
                    active_jobs: self.active_jobs.clone(),
                    poll_interval: self.config.poll_interval(),
                    job_timeout: self.config.job_timeout(),
                };
                join_set.spawn(worker.run());
            }
        }
    }

    /// Stop the worker pool and wait for every worker to exit.
    ///
    /// Jobs interrupted by the stop go back to waiting.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Number of jobs currently being processed.
    pub fn active_count(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

struct Worker {
    id: usize,
    queue_name: String,
    handler: Arc<dyn ErasedHandler>,
    job_queue: Arc<JobQueue>,
    cancellation_token: CancellationToken,
    active_jobs: Arc<AtomicUsize>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(queue = %self.queue_name, worker = self.id, "Worker started");
        let notifier = self.job_queue.notifier();

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            // Register interest before looking, so a notify in between is kept.
            let notified = notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.job_queue.dequeue(&self.queue_name).await {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(queue = %self.queue_name, error = %e, "Error dequeuing job"),
            }

            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!(queue = %self.queue_name, worker = self.id, "Worker shutting down");
    }

    async fn process(&self, job: Job) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let job_id = job.id.clone();
        let timeout = job
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.job_timeout);

        debug!(
            queue = %self.queue_name,
            worker = self.id,
            job_id = %job_id,
            attempt = job.attempts_made,
            "Processing job"
        );

        let ctx = JobContext::new(job.clone(), self.job_queue.clone());
        let execution = AssertUnwindSafe(self.handler.run(&job, &ctx)).catch_unwind();

        let result = tokio::select! {
            _ = self.cancellation_token.cancelled() => None,
            r = tokio::time::timeout(timeout, execution) => Some(r),
        };

        let settled = match result {
            None => self.job_queue.requeue_interrupted(&job_id).await,
            Some(Ok(Ok(Ok(value)))) => self.job_queue.complete(&job_id, value).await,
            Some(Ok(Ok(Err(e)))) => self.job_queue.fail(&job_id, &e).await.map(|_| ()),
            Some(Ok(Err(_panic))) => {
                let e = Error::Other("job handler panicked".to_string());
                self.job_queue.fail(&job_id, &e).await.map(|_| ())
            }
            Some(Err(_)) => {
                let e = Error::Timeout {
                    operation: format!("{} job {}", self.queue_name, job_id),
                    after: timeout,
                };
                self.job_queue.fail(&job_id, &e).await.map(|_| ())
            }
        };

        if let Err(e) = settled {
            warn!(job_id = %job_id, error = %e, "Failed to record job outcome");
        }
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobQueueConfig;
    use crate::events::EventBus;
    use crate::queue::{JobHandler, JobOptions, JobPayload, JobState};
    use crate::resilience::BackoffPolicy;
    use crate::Result;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Sleep {
        ms: u64,
    }

    impl JobPayload for Sleep {
        const QUEUE: &'static str = "sleep";
    }

    struct SleepHandler;

    #[async_trait]
    impl JobHandler for SleepHandler {
        type Payload = Sleep;
        type Output = u64;

        async fn handle(&self, payload: Sleep, ctx: &JobContext) -> Result<u64> {
            ctx.update_progress(50.0).await?;
            tokio::time::sleep(Duration::from_millis(payload.ms)).await;
            Ok(payload.ms)
        }
    }

    fn config(timeout_secs: u64) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: 2,
            job_timeout_secs: timeout_secs,
            poll_interval_ms: 20,
        }
    }

    fn setup() -> (Arc<JobQueue>, Arc<QueueRegistry>) {
        let queue = Arc::new(JobQueue::new(JobQueueConfig::default(), EventBus::new(64)));
        let registry = Arc::new(QueueRegistry::new());
        registry.register(SleepHandler).unwrap();
        (queue, registry)
    }

    #[test]
    fn test_worker_pool_creation() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        assert!(pool.is_running());
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_processes_jobs() {
        let (queue, registry) = setup();
        let pool = WorkerPool::new(config(5));
        pool.start(queue.clone(), registry);

        let handle = queue.enqueue("s", &Sleep { ms: 5 }, JobOptions::new()).await.unwrap();
        let job = queue
            .wait_until_finished(&handle.id, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value, Some(serde_json::json!(5)));
        assert_eq!(job.progress.as_percent(), Some(50.0));
        pool.stop().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_timeout_fails_attempt() {
        let (queue, registry) = setup();
        let pool = WorkerPool::new(config(1));
        pool.start(queue.clone(), registry);

        let handle = queue
            .enqueue(
                "s",
                &Sleep { ms: 5_000 },
                JobOptions::new()
                    .with_attempts(1)
                    .with_backoff(BackoffPolicy::fixed(Duration::ZERO)),
            )
            .await
            .unwrap();
        let job = queue
            .wait_until_finished(&handle.id, Duration::from_secs(3))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert!(job.failed_reason.unwrap().contains("timed out"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_requeues_running_job() {
        let (queue, registry) = setup();
        let pool = WorkerPool::new(config(30));
        pool.start(queue.clone(), registry);

        let handle = queue.enqueue("s", &Sleep { ms: 10_000 }, JobOptions::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.active_count(), 1);

        pool.stop().await;
        let job = queue.get_job(&handle.id).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
    }
}
