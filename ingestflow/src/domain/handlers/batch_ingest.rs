use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::{BatchProgress, BatchRunner, ItemOutcome, partition};
use crate::config::BatchConfig;
use crate::domain::collaborators::Datastore;
use crate::domain::flows::document_flow;
use crate::domain::payloads::BatchIngestPayload;
use crate::domain::records::RecordKind;
use crate::flow::FlowProducer;
use crate::progress::JobProgress;
use crate::queue::{JobContext, JobHandler, JobState};
use crate::resilience::CircuitBreakerRegistry;
use crate::{Error, Result};

use super::ProgressForwarder;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestFailure {
    pub document_id: String,
    pub reason: String,
}

impl IngestFailure {
    fn new(document_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            reason: reason.into(),
        }
    }
}

/// Return value of a `batch-ingest` job. Partial success still completes the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub total_documents: usize,
    pub batches: usize,
    pub ingested: usize,
    pub failed: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Clone)]
struct IngestTarget {
    document_id: String,
    url: String,
}

#[derive(Debug, Default)]
struct BatchResult {
    ingested: Vec<String>,
    failed: Vec<IngestFailure>,
}

/// Ingests a set of documents in bounded batches.
///
/// Each batch submits one scrape-then-update flow per document through the
/// `webFlow:<chatbotId>` breaker and waits for all of them. At most
/// `concurrency` batches are in flight at once.
pub struct BatchIngestHandler {
    datastore: Arc<dyn Datastore>,
    flows: Arc<FlowProducer>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: BatchConfig,
    flow_timeout: Duration,
}

impl BatchIngestHandler {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        flows: Arc<FlowProducer>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: BatchConfig,
        flow_timeout: Duration,
    ) -> Self {
        Self {
            datastore,
            flows,
            breakers,
            config,
            flow_timeout,
        }
    }

    async fn resolve_targets(
        &self,
        document_ids: &[String],
        failures: &mut Vec<IngestFailure>,
    ) -> Result<Vec<IngestTarget>> {
        let mut targets = Vec::with_capacity(document_ids.len());
        for id in document_ids {
            match self.datastore.find(RecordKind::Document, id).await? {
                Some(document) => match document.str_field("url") {
                    Some(url) => targets.push(IngestTarget {
                        document_id: id.clone(),
                        url: url.to_string(),
                    }),
                    None => failures.push(IngestFailure::new(id, "document has no url")),
                },
                None => failures.push(IngestFailure::new(id, "document not found")),
            }
        }
        Ok(targets)
    }
}

#[async_trait]
impl JobHandler for BatchIngestHandler {
    type Payload = BatchIngestPayload;
    type Output = IngestSummary;

    async fn handle(&self, payload: BatchIngestPayload, ctx: &JobContext) -> Result<IngestSummary> {
        let mut failures = Vec::new();
        let targets = self
            .resolve_targets(&payload.document_ids, &mut failures)
            .await?;

        let batch_size = payload.batch_size.unwrap_or(self.config.batch_size);
        let batches = partition(&targets, batch_size);
        let batch_members: Vec<Vec<String>> = batches
            .iter()
            .map(|b| b.iter().map(|t| t.document_id.clone()).collect())
            .collect();

        info!(
            job_id = %ctx.job_id(),
            chatbot_id = %payload.chatbot_id,
            documents = targets.len(),
            batches = batches.len(),
            "Starting batch ingestion"
        );

        let forwarder = ProgressForwarder::spawn(ctx);
        let tx = forwarder.sender();
        let flows = self.flows.clone();
        let breakers = self.breakers.clone();
        let chatbot_id = payload.chatbot_id.clone();
        let flow_timeout = self.flow_timeout;

        let report = BatchRunner::new(self.config.concurrency)
            .run(
                batches,
                move |batch: Vec<IngestTarget>| {
                    let flows = flows.clone();
                    let breakers = breakers.clone();
                    let chatbot_id = chatbot_id.clone();
                    async move {
                        ingest_batch(&flows, &breakers, &chatbot_id, batch, flow_timeout).await
                    }
                },
                move |progress: BatchProgress| {
                    let _ = tx.send(JobProgress::percent(progress.percent()));
                },
            )
            .await;
        forwarder.finish().await;

        let mut ingested = 0;
        for (index, outcome) in report.outcomes.into_iter().enumerate() {
            match outcome {
                ItemOutcome::Succeeded(result) => {
                    ingested += result.ingested.len();
                    failures.extend(result.failed);
                }
                ItemOutcome::Failed(reason) => {
                    warn!(job_id = %ctx.job_id(), batch = index, reason = %reason, "Batch failed");
                    failures.extend(
                        batch_members[index]
                            .iter()
                            .map(|id| IngestFailure::new(id, reason.clone())),
                    );
                }
            }
        }
        ctx.update_progress(100.0).await?;

        let summary = IngestSummary {
            total_documents: payload.document_ids.len(),
            batches: batch_members.len(),
            ingested,
            failed: failures.len(),
            failures,
        };
        info!(
            job_id = %ctx.job_id(),
            ingested = summary.ingested,
            failed = summary.failed,
            "Batch ingestion finished"
        );
        Ok(summary)
    }
}

/// Submit and await one batch of document flows through the `webFlow` breaker.
///
/// A batch in which every flow failed counts as a failure of the breaker's
/// operation; any success keeps it closed. The per-document results are
/// returned either way. Only a batch the breaker refused is an error.
async fn ingest_batch(
    flows: &FlowProducer,
    breakers: &CircuitBreakerRegistry,
    chatbot_id: &str,
    batch: Vec<IngestTarget>,
    flow_timeout: Duration,
) -> Result<BatchResult> {
    let key = format!("webFlow:{}", chatbot_id);
    let mut settled: Option<BatchResult> = None;
    let slot = &mut settled;

    let outcome = breakers
        .call(&key, move || async move {
            let nodes = batch
                .iter()
                .map(|t| document_flow(chatbot_id, &t.document_id, &t.url))
                .collect();
            let handles = flows.add_bulk(nodes).await;

            let mut result = BatchResult::default();
            for (target, handle) in batch.iter().zip(handles) {
                let finished = match handle {
                    Ok(handle) => flows.wait_for(&handle, flow_timeout).await,
                    Err(e) => Err(e),
                };
                match finished {
                    Ok(job) if job.state == JobState::Completed => {
                        result.ingested.push(target.document_id.clone());
                    }
                    Ok(job) => result.failed.push(IngestFailure::new(
                        &target.document_id,
                        job.failed_reason
                            .unwrap_or_else(|| format!("flow ended in state {}", job.state)),
                    )),
                    Err(e) => result
                        .failed
                        .push(IngestFailure::new(&target.document_id, e.to_string())),
                }
            }

            let all_failed = result.ingested.is_empty() && !result.failed.is_empty();
            let failed = result.failed.len();
            *slot = Some(result);
            if all_failed {
                return Err(Error::transient(
                    "webFlow",
                    format!("all {} flows in batch failed", failed),
                ));
            }
            Ok(())
        })
        .await;

    match settled {
        Some(result) => {
            debug!(
                key = %key,
                ingested = result.ingested.len(),
                failed = result.failed.len(),
                breaker_failure = outcome.is_err(),
                "Batch settled"
            );
            Ok(result)
        }
        None => outcome.map(|()| BatchResult::default()),
    }
}
