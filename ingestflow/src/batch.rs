//! Concurrency-bounded runner with all-settle semantics.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::Result;

/// Split `items` into consecutive slices of at most `size` elements.
pub fn partition<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

/// Running totals, reported once per settled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub settled: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.settled as f64 / self.total as f64 * 100.0
    }
}

/// Result of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    Succeeded(T),
    Failed(String),
}

impl<T> ItemOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded(_))
    }
}

/// Outcomes in input order plus aggregate counts.
#[derive(Debug, Clone)]
pub struct BatchReport<T> {
    pub outcomes: Vec<ItemOutcome<T>>,
    pub succeeded: usize,
    pub failed: usize,
}

impl<T> BatchReport<T> {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// `(index, reason)` of every failed item.
    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| match o {
                ItemOutcome::Failed(reason) => Some((i, reason.as_str())),
                ItemOutcome::Succeeded(_) => None,
            })
            .collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.outcomes.iter().filter_map(|o| match o {
            ItemOutcome::Succeeded(v) => Some(v),
            ItemOutcome::Failed(_) => None,
        })
    }
}

/// Runs one async action per item with at most `concurrency` in flight.
///
/// Every item is attempted exactly once and the runner waits for all of them
/// to settle. A failing or panicking action is recorded against its item and
/// never aborts its siblings.
#[derive(Debug, Clone, Copy)]
pub struct BatchRunner {
    concurrency: usize,
}

impl BatchRunner {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<I, T, F, Fut, P>(
        &self,
        items: Vec<I>,
        action: F,
        mut on_progress: P,
    ) -> BatchReport<T>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        P: FnMut(BatchProgress),
    {
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let action = Arc::new(action);
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let action = action.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (index, Err("concurrency limiter closed".to_string())),
                };
                let outcome = AssertUnwindSafe(action(item)).catch_unwind().await;
                let outcome = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(panic) => Err(panic_message(panic.as_ref())),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<ItemOutcome<T>>> = (0..total).map(|_| None).collect();
        let mut progress = BatchProgress {
            settled: 0,
            total,
            succeeded: 0,
            failed: 0,
        };

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Batch task did not complete");
                    continue;
                }
            };
            match outcome {
                Ok(value) => {
                    progress.succeeded += 1;
                    outcomes[index] = Some(ItemOutcome::Succeeded(value));
                }
                Err(reason) => {
                    debug!(index, reason = %reason, "Batch item failed");
                    progress.failed += 1;
                    outcomes[index] = Some(ItemOutcome::Failed(reason));
                }
            }
            progress.settled += 1;
            on_progress(progress);
        }

        // Tasks that never reported (aborted runtime) still settle as failures.
        for slot in outcomes.iter_mut().filter(|s| s.is_none()) {
            *slot = Some(ItemOutcome::Failed("task aborted".to_string()));
            progress.failed += 1;
            progress.settled += 1;
            on_progress(progress);
        }

        BatchReport {
            outcomes: outcomes.into_iter().flatten().collect(),
            succeeded: progress.succeeded,
            failed: progress.failed,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_partition() {
        let items: Vec<u32> = (0..23).collect();
        let batches = partition(&items, 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[2], vec![20, 21, 22]);
        assert!(partition::<u32>(&[], 10).is_empty());
        assert_eq!(partition(&[1, 2], 0).len(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let runner = BatchRunner::new(3);
        let report = {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            runner
                .run(
                    (0..50).collect::<Vec<u32>>(),
                    move |i| {
                        let in_flight = in_flight.clone();
                        let max_seen = max_seen.clone();
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(i)
                        }
                    },
                    |_| {},
                )
                .await
        };

        assert_eq!(report.succeeded, 50);
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(max_seen.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_partial_failure_settles_everything() {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();

        let report = BatchRunner::new(3)
            .run(
                (0..10).collect::<Vec<u32>>(),
                |i| async move {
                    tokio::time::sleep(Duration::from_millis((10 - i as u64) * 2)).await;
                    if i == 3 || i == 7 {
                        Err(Error::transient("scraper", format!("item {i} failed")))
                    } else {
                        Ok(i * 10)
                    }
                },
                move |p| seen.lock().push(p),
            )
            .await;

        assert_eq!(report.succeeded, 8);
        assert_eq!(report.failed, 2);
        let failed: Vec<usize> = report.failures().iter().map(|(i, _)| *i).collect();
        assert_eq!(failed, vec![3, 7]);
        assert_eq!(report.outcomes[4], ItemOutcome::Succeeded(40));

        let progress = progress.lock();
        assert_eq!(progress.len(), 10);
        assert_eq!(progress.last().unwrap().percent(), 100.0);
        assert!(
            progress
                .windows(2)
                .all(|w| w[0].percent() <= w[1].percent())
        );
    }

    #[tokio::test]
    async fn test_panicking_item_is_recorded() {
        let report = BatchRunner::new(2)
            .run(
                vec![1u32, 2, 3],
                |i| async move {
                    if i == 2 {
                        panic!("bad item");
                    }
                    Ok(i)
                },
                |_| {},
            )
            .await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(report.failures()[0].1.contains("bad item"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let report = BatchRunner::new(2)
            .run(Vec::<u32>::new(), |i| async move { Ok(i) }, |_| {})
            .await;
        assert_eq!(report.total(), 0);
    }
}
