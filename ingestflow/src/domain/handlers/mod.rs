//! Per-queue handlers.

mod batch_ingest;
mod crawl;
mod fetch;
mod insights;
mod update_record;

pub use batch_ingest::{BatchIngestHandler, IngestFailure, IngestSummary};
pub use crawl::{CrawlHandler, CrawlSummary};
pub use fetch::{ScrapeHandler, ScrapedContent, ScreenshotHandler, ScreenshotResult};
pub use insights::ChatInsightsHandler;
pub use update_record::UpdateRecordHandler;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::progress::JobProgress;
use crate::queue::JobContext;

/// Forwards progress produced by synchronous callbacks to the running job,
/// in the order it was produced.
pub(crate) struct ProgressForwarder {
    tx: mpsc::UnboundedSender<JobProgress>,
    task: JoinHandle<()>,
}

impl ProgressForwarder {
    pub(crate) fn spawn(ctx: &JobContext) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobProgress>();
        let ctx = ctx.clone();
        let task = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                if let Err(e) = ctx.update_progress(progress).await {
                    debug!(job_id = %ctx.job_id(), error = %e, "Dropped progress update");
                }
            }
        });
        Self { tx, task }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<JobProgress> {
        self.tx.clone()
    }

    /// Wait until every update sent so far is applied.
    ///
    /// Senders handed out by [`ProgressForwarder::sender`] must be dropped first.
    pub(crate) async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            debug!(error = %e, "Progress forwarder stopped abnormally");
        }
    }
}
