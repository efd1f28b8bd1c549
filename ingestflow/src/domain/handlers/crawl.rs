use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, json};
use tracing::info;

use crate::Result;
use crate::domain::collaborators::{Crawler, Datastore};
use crate::domain::payloads::{BatchIngestPayload, CrawlPayload};
use crate::domain::records::RecordKind;
use crate::progress::{CrawlProgress, JobProgress};
use crate::queue::{JobContext, JobHandler, JobOptions};
use crate::resilience::CircuitBreakerRegistry;

use super::ProgressForwarder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlSummary {
    pub discovered: usize,
    pub document_ids: Vec<String>,
    pub batch_job_id: String,
}

/// Crawls a site, creates a pending document per discovered URL and hands
/// them to a `batch-ingest` job.
pub struct CrawlHandler {
    crawler: Arc<dyn Crawler>,
    datastore: Arc<dyn Datastore>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl CrawlHandler {
    pub fn new(
        crawler: Arc<dyn Crawler>,
        datastore: Arc<dyn Datastore>,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            crawler,
            datastore,
            breakers,
        }
    }
}

/// Id of the document created for `url` by crawl job `job_id`. Stable
/// across attempts of one job.
fn crawl_document_id(job_id: &str, url: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, format!("{job_id} {url}").as_bytes()).to_string()
}

#[async_trait]
impl JobHandler for CrawlHandler {
    type Payload = CrawlPayload;
    type Output = CrawlSummary;

    async fn handle(&self, payload: CrawlPayload, ctx: &JobContext) -> Result<CrawlSummary> {
        let forwarder = ProgressForwarder::spawn(ctx);
        let tx = forwarder.sender();
        let report = move |progress: CrawlProgress| {
            if let Ok(progress) = JobProgress::structured(&progress) {
                let _ = tx.send(progress);
            }
        };

        let key = format!("crawl:{}", payload.chatbot_id);
        let crawled = self
            .breakers
            .call(&key, || {
                self.crawler
                    .crawl(&payload.start_url, payload.max_links, &report)
            })
            .await;
        drop(report);
        forwarder.finish().await;
        let urls = crawled?;

        let mut document_ids: Vec<String> = Vec::with_capacity(urls.len());
        for url in &urls {
            let id = crawl_document_id(ctx.job_id(), url);
            if document_ids.contains(&id) {
                continue;
            }
            // An earlier attempt of this job may have created it already.
            let document = match self.datastore.find(RecordKind::Document, &id).await? {
                Some(existing) => existing,
                None => {
                    let mut fields = Map::new();
                    fields.insert("url".to_string(), json!(url));
                    fields.insert("status".to_string(), json!("pending"));
                    self.datastore
                        .create_with_id(RecordKind::Document, &id, &payload.chatbot_id, fields)
                        .await?
                }
            };
            document_ids.push(document.id);
        }

        // Keyed on this job so a retried crawl reuses the same ingest job.
        let batch = ctx
            .queue()
            .enqueue(
                &format!("ingest-{}", payload.chatbot_id),
                &BatchIngestPayload {
                    chatbot_id: payload.chatbot_id.clone(),
                    document_ids: document_ids.clone(),
                    batch_size: None,
                },
                JobOptions::new().with_job_id(format!("batch-ingest:{}", ctx.job_id())),
            )
            .await?;

        info!(
            job_id = %ctx.job_id(),
            chatbot_id = %payload.chatbot_id,
            discovered = urls.len(),
            batch_job_id = %batch.id,
            "Crawl finished"
        );

        Ok(CrawlSummary {
            discovered: urls.len(),
            document_ids,
            batch_job_id: batch.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_document_id_is_stable_per_job_and_url() {
        let a = crawl_document_id("job-1", "https://example.com/a");
        assert_eq!(a, crawl_document_id("job-1", "https://example.com/a"));
        assert_ne!(a, crawl_document_id("job-1", "https://example.com/b"));
        assert_ne!(a, crawl_document_id("job-2", "https://example.com/a"));
    }
}
