//! Integration tests for the ingestion engine.
//!
//! These tests run the real queue, flow producer and worker pool against
//! in-memory collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use ingestflow::config::EngineConfig;
use ingestflow::domain::handlers::{CrawlSummary, IngestSummary};
use ingestflow::domain::{
    BatchIngestPayload, ChatInsights, ChatInsightsPayload, CrawlPayload, CrawlProgressFn, Crawler,
    Datastore, IndexInvalidator, InsightGenerator, MemoryDatastore, Record, RecordKind,
    ScrapePayload, Scraper, ScreenshotService, UpdateRecordPayload, product_screenshot_flow,
};
use ingestflow::events::JobEvent;
use ingestflow::flow::FlowNode;
use ingestflow::progress::CrawlProgress;
use ingestflow::queue::{JobContext, JobHandler, JobOptions, JobPayload, JobState};
use ingestflow::resilience::{BackoffPolicy, CircuitState};
use ingestflow::{Error, IngestEngine, Result};

const WAIT: Duration = Duration::from_secs(10);

/// Scraper serving canned pages. URLs listed in `transient` fail that many
/// times before succeeding; URLs in `broken` always fail validation.
#[derive(Default)]
struct FakeScraper {
    transient: Mutex<HashMap<String, usize>>,
    broken: Vec<String>,
    calls: AtomicUsize,
}

impl FakeScraper {
    fn flaky(url: &str, failures: usize) -> Self {
        let scraper = Self::default();
        scraper.transient.lock().insert(url.to_string(), failures);
        scraper
    }

    fn broken(urls: &[&str]) -> Self {
        Self {
            broken: urls.iter().map(|u| u.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn scrape(&self, url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.broken.iter().any(|b| b == url) {
            return Err(Error::validation(format!("no text content at {}", url)));
        }
        if let Some(remaining) = self.transient.lock().get_mut(url)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::transient("scraper", "connection reset"));
        }
        Ok(format!("content of {}", url))
    }
}

struct FakeScreenshots;

#[async_trait]
impl ScreenshotService for FakeScreenshots {
    async fn capture(&self, url: &str) -> Result<String> {
        Ok(format!("s3://shots/{}.png", url.rsplit('/').next().unwrap_or("page")))
    }
}

struct FakeCrawler {
    urls: Vec<String>,
}

#[async_trait]
impl Crawler for FakeCrawler {
    async fn crawl(
        &self,
        start_url: &str,
        max_links: usize,
        on_progress: &CrawlProgressFn,
    ) -> Result<Vec<String>> {
        let urls: Vec<String> = self.urls.iter().take(max_links).cloned().collect();
        for (i, url) in urls.iter().enumerate() {
            on_progress(CrawlProgress::new(i + 1, urls.len(), "crawling").with_url(url));
        }
        assert!(start_url.starts_with("https://"));
        Ok(urls)
    }
}

struct FakeInsights;

#[async_trait]
impl InsightGenerator for FakeInsights {
    async fn generate(&self, _chat: &Record) -> Result<ChatInsights> {
        Ok(ChatInsights {
            summary: "Customer asked about pricing".into(),
            sentiment: "positive".into(),
            topics: vec!["pricing".into()],
            resolved: true,
        })
    }
}

/// Records how many datastore updates had happened at each invalidation.
struct RecordingInvalidator {
    datastore: Arc<MemoryDatastore>,
    seen_updates: Mutex<Vec<usize>>,
}

#[async_trait]
impl IndexInvalidator for RecordingInvalidator {
    async fn invalidate(&self, _chatbot_id: &str, _kind: RecordKind, _id: &str) -> Result<()> {
        self.seen_updates.lock().push(self.datastore.update_count());
        Ok(())
    }
}

/// Datastore whose `nth` document creation fails once with a transient error.
struct FlakyDatastore {
    inner: Arc<MemoryDatastore>,
    nth: usize,
    creates: AtomicUsize,
}

#[async_trait]
impl Datastore for FlakyDatastore {
    async fn find(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        self.inner.find(kind, id).await
    }

    async fn update(&self, kind: RecordKind, id: &str, fields: Map<String, Value>) -> Result<Record> {
        self.inner.update(kind, id, fields).await
    }

    async fn create(
        &self,
        kind: RecordKind,
        chatbot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record> {
        self.inner.create(kind, chatbot_id, fields).await
    }

    async fn create_with_id(
        &self,
        kind: RecordKind,
        id: &str,
        chatbot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record> {
        if self.creates.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            return Err(Error::transient("datastore", "connection reset"));
        }
        self.inner.create_with_id(kind, id, chatbot_id, fields).await
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue.default_backoff = BackoffPolicy::fixed(Duration::from_millis(10));
    config.workers.concurrency = 2;
    config.workers.poll_interval_ms = 20;
    config.workers.job_timeout_secs = 10;
    config.batch.batch_size = 3;
    config.batch.concurrency = 2;
    config
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

async fn create_document(datastore: &MemoryDatastore, chatbot_id: &str, url: &str) -> Record {
    datastore
        .create(
            RecordKind::Document,
            chatbot_id,
            fields(json!({"url": url, "status": "pending"})),
        )
        .await
        .expect("create document")
}

mod queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_with_same_id_is_idempotent() {
        let datastore = Arc::new(MemoryDatastore::new());
        let engine = IngestEngine::builder(test_config(), datastore)
            .with_scraper(Arc::new(FakeScraper::default()))
            .build()
            .await
            .unwrap();

        let payload = ScrapePayload {
            document_id: "d1".into(),
            url: "https://example.com/a".into(),
        };
        let first = engine
            .queue()
            .enqueue("scrape-d1", &payload, JobOptions::new().with_job_id("scrape:d1"))
            .await
            .unwrap();
        let second = engine
            .queue()
            .enqueue("scrape-d1", &payload, JobOptions::new().with_job_id("scrape:d1"))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(engine.queue().counts().total(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let url = "https://example.com/flaky";
        let engine = IngestEngine::builder(test_config(), Arc::new(MemoryDatastore::new()))
            .with_scraper(Arc::new(FakeScraper::flaky(url, 2)))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let handle = engine
            .queue()
            .enqueue(
                "scrape-flaky",
                &ScrapePayload {
                    document_id: "d1".into(),
                    url: url.into(),
                },
                JobOptions::new(),
            )
            .await
            .unwrap();
        let job = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.return_value.unwrap()["content"], "content of https://example.com/flaky");
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_validation_failures_are_not_retried() {
        let url = "https://example.com/empty";
        let scraper = Arc::new(FakeScraper::broken(&[url]));
        let engine = IngestEngine::builder(test_config(), Arc::new(MemoryDatastore::new()))
            .with_scraper(scraper.clone())
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let handle = engine
            .queue()
            .enqueue(
                "scrape-empty",
                &ScrapePayload {
                    document_id: "d1".into(),
                    url: url.into(),
                },
                JobOptions::new().with_attempts(5),
            )
            .await
            .unwrap();
        let job = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);
        assert!(job.failed_reason.unwrap().contains("no text content"));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_repeat_schedule_is_idempotent() {
        let datastore = Arc::new(MemoryDatastore::new());
        let engine = IngestEngine::builder(test_config(), datastore)
            .with_insights(Arc::new(FakeInsights))
            .build()
            .await
            .unwrap();

        let payload = ChatInsightsPayload {
            chatbot_id: "bot-1".into(),
            chat_id: "chat-1".into(),
        };
        engine
            .schedule_chat_insights(&payload, "0 15 3 * * *")
            .await
            .unwrap();
        engine
            .schedule_chat_insights(&payload, "0 15 3 * * *")
            .await
            .unwrap();

        let repeats = engine.queue().repeatable_jobs();
        assert_eq!(repeats.len(), 1);
        assert_eq!(repeats[0].key, "chat-insights:chat-1");
        assert_eq!(engine.queue().queue_counts("chat-insights").delayed, 1);

        assert!(engine.queue().remove_repeatable("chat-insights:chat-1").await.unwrap());
        assert_eq!(engine.queue().queue_counts("chat-insights").total(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_topic() {
        let engine = IngestEngine::builder(test_config(), Arc::new(MemoryDatastore::new()))
            .build()
            .await
            .unwrap();

        let subscription = engine.subscribe("job-1");
        let other = engine.subscribe("job-1");
        assert_eq!(engine.events().topic_count(), 1);
        assert_eq!(engine.events().subscriber_count("job-1"), 2);

        subscription.unsubscribe();
        assert_eq!(engine.events().subscriber_count("job-1"), 1);
        drop(other);
        assert_eq!(engine.events().topic_count(), 0);
    }
}

mod flow_tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct RoguePayload {
        product_id: String,
    }

    impl JobPayload for RoguePayload {
        const QUEUE: &'static str = "rogue";
    }

    /// Child whose result tries to overwrite the record id.
    struct RogueHandler;

    #[async_trait]
    impl JobHandler for RogueHandler {
        type Payload = RoguePayload;
        type Output = Value;

        async fn handle(&self, payload: RoguePayload, _ctx: &JobContext) -> Result<Value> {
            Ok(json!({"id": "hijacked", "name": payload.product_id}))
        }
    }

    #[tokio::test]
    async fn test_parent_runs_after_child_and_sees_one_value() {
        let datastore = Arc::new(MemoryDatastore::new());
        let product = datastore
            .create(
                RecordKind::Product,
                "bot-1",
                fields(json!({"name": "Widget", "url": "https://shop.example.com/widget"})),
            )
            .await
            .unwrap();
        let invalidator = Arc::new(RecordingInvalidator {
            datastore: datastore.clone(),
            seen_updates: Mutex::new(Vec::new()),
        });

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .with_screenshots(Arc::new(FakeScreenshots))
            .with_invalidator(invalidator.clone())
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let flow = product_screenshot_flow("bot-1", &product.id, "https://shop.example.com/widget");
        let handle = engine.flows().add_flow(flow).await.unwrap();
        let parent = engine.flows().wait_for(&handle, WAIT).await.unwrap();
        assert_eq!(parent.state, JobState::Completed);

        let child = engine.queue().get_job(&handle.children[0].job.id).unwrap();
        assert_eq!(child.state, JobState::Completed);
        assert!(parent.processed_at.unwrap() >= child.finished_at.unwrap());

        let values = engine.queue().children_values(&parent.id).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values.completed(&child.key()).unwrap(),
            &json!({"screenshot_url": "s3://shots/widget.png"})
        );

        let stored = datastore.get(&product.id).unwrap();
        assert_eq!(stored.str_field("screenshot_url"), Some("s3://shots/widget.png"));
        assert_eq!(stored.str_field("name"), Some("Widget"));
        // Invalidation ran after the write
        assert_eq!(*invalidator.seen_updates.lock(), vec![1]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_disallowed_field_fails_parent_without_update() {
        let datastore = Arc::new(MemoryDatastore::new());
        let product = datastore
            .create(RecordKind::Product, "bot-1", fields(json!({"name": "Widget"})))
            .await
            .unwrap();

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .build()
            .await
            .unwrap();
        engine.register(RogueHandler).unwrap();
        engine.start().await.unwrap();

        let child = FlowNode::new(
            "rogue-1",
            &RoguePayload {
                product_id: product.id.clone(),
            },
        );
        let parent = FlowNode::new(
            "update-product",
            &UpdateRecordPayload {
                kind: RecordKind::Product,
                record_id: product.id.clone(),
                chatbot_id: "bot-1".into(),
                child_key: child.key(),
            },
        )
        .with_child(child);

        let handle = engine.flows().add_flow(parent).await.unwrap();
        let parent = engine.flows().wait_for(&handle, WAIT).await.unwrap();

        assert_eq!(parent.state, JobState::Failed);
        assert_eq!(parent.attempts_made, 1);
        assert!(parent.failed_reason.unwrap().contains("'id'"));
        assert_eq!(datastore.update_count(), 0);
        assert_eq!(datastore.get(&product.id).unwrap(), product);
        engine.stop().await;
    }
}

mod ingestion_tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_ingest_reports_partial_failure() {
        let broken = "https://example.com/page-4";
        let datastore = Arc::new(MemoryDatastore::new());
        let scraper = Arc::new(FakeScraper::broken(&[broken]));

        let mut document_ids = Vec::new();
        for i in 0..7 {
            let doc = create_document(&datastore, "bot-1", &format!("https://example.com/page-{i}")).await;
            document_ids.push(doc.id);
        }
        document_ids.push("missing-document".to_string());

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .with_scraper(scraper.clone())
            .build()
            .await
            .unwrap();

        let handle = engine
            .ingest(&BatchIngestPayload {
                chatbot_id: "bot-1".into(),
                document_ids: document_ids.clone(),
                batch_size: None,
            })
            .await
            .unwrap();
        let mut subscription = engine.subscribe(&handle.id);
        engine.start().await.unwrap();

        let mut percents = Vec::new();
        while let Some(event) = subscription.recv().await {
            match event {
                JobEvent::Progress { progress, .. } => {
                    percents.extend(progress.as_percent());
                }
                e if e.is_terminal() => break,
                _ => {}
            }
        }
        subscription.unsubscribe();

        let job = engine.queue().get_job(&handle.id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        let summary: IngestSummary = serde_json::from_value(job.return_value.unwrap()).unwrap();
        assert_eq!(summary.total_documents, 8);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.ingested, 6);
        assert_eq!(summary.failed, 2);
        let failed_ids: Vec<&str> = summary.failures.iter().map(|f| f.document_id.as_str()).collect();
        assert!(failed_ids.contains(&"missing-document"));
        assert!(failed_ids.contains(&document_ids[4].as_str()));

        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last().copied(), Some(100.0));

        let ok = datastore.get(&document_ids[0]).unwrap();
        assert_eq!(ok.str_field("status"), Some("completed"));
        assert_eq!(ok.str_field("content"), Some("content of https://example.com/page-0"));
        assert_eq!(ok.field("char_count"), Some(&json!(37)));
        let failed = datastore.get(&document_ids[4]).unwrap();
        assert_eq!(failed.str_field("status"), Some("pending"));

        assert_eq!(
            engine.breakers().get("webFlow:bot-1").state(),
            CircuitState::Closed
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_open_circuit_fails_batches_fast() {
        let datastore = Arc::new(MemoryDatastore::new());
        let scraper = Arc::new(FakeScraper::default());
        let doc = create_document(&datastore, "bot-2", "https://example.com/a").await;

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .with_scraper(scraper.clone())
            .build()
            .await
            .unwrap();
        let breaker = engine.breakers().get("webFlow:bot-2");
        for _ in 0..engine.config().breaker.failure_threshold {
            let _ = breaker
                .call(|| async { Err::<(), _>(Error::transient("webFlow", "down")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        engine.start().await.unwrap();

        let handle = engine
            .ingest(&BatchIngestPayload {
                chatbot_id: "bot-2".into(),
                document_ids: vec![doc.id.clone()],
                batch_size: None,
            })
            .await
            .unwrap();
        let job = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();

        let summary: IngestSummary = serde_json::from_value(job.return_value.unwrap()).unwrap();
        assert_eq!(summary.ingested, 0);
        assert_eq!(summary.failed, 1);
        assert!(summary.failures[0].reason.contains("webFlow:bot-2"));
        assert_eq!(scraper.calls.load(Ordering::SeqCst), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_crawl_creates_documents_and_ingests_them() {
        let datastore = Arc::new(MemoryDatastore::new());
        let urls: Vec<String> = (0..4)
            .map(|i| format!("https://docs.example.com/p{i}"))
            .collect();

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .with_crawler(Arc::new(FakeCrawler { urls: urls.clone() }))
            .with_scraper(Arc::new(FakeScraper::default()))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let handle = engine
            .crawl(&CrawlPayload {
                chatbot_id: "bot-3".into(),
                start_url: "https://docs.example.com".into(),
                max_links: 3,
            })
            .await
            .unwrap();
        let crawl = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();
        assert_eq!(crawl.state, JobState::Completed);

        let summary: CrawlSummary = serde_json::from_value(crawl.return_value.unwrap()).unwrap();
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.batch_job_id, format!("batch-ingest:{}", handle.id));

        let ingest = engine
            .queue()
            .wait_until_finished(&summary.batch_job_id, WAIT)
            .await
            .unwrap();
        let ingest: IngestSummary = serde_json::from_value(ingest.return_value.unwrap()).unwrap();
        assert_eq!(ingest.ingested, 3);

        let documents = datastore.records(RecordKind::Document);
        assert_eq!(documents.len(), 3);
        assert!(documents.iter().all(|d| d.str_field("status") == Some("completed")));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_retried_crawl_reuses_created_documents() {
        let datastore = Arc::new(MemoryDatastore::new());
        let flaky = Arc::new(FlakyDatastore {
            inner: datastore.clone(),
            nth: 3,
            creates: AtomicUsize::new(0),
        });
        let urls: Vec<String> = (0..3)
            .map(|i| format!("https://docs.example.com/r{i}"))
            .collect();

        let engine = IngestEngine::builder(test_config(), flaky)
            .with_crawler(Arc::new(FakeCrawler { urls }))
            .with_scraper(Arc::new(FakeScraper::default()))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let handle = engine
            .crawl(&CrawlPayload {
                chatbot_id: "bot-4".into(),
                start_url: "https://docs.example.com".into(),
                max_links: 10,
            })
            .await
            .unwrap();
        let crawl = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();
        assert_eq!(crawl.state, JobState::Completed);
        assert_eq!(crawl.attempts_made, 2);

        let summary: CrawlSummary = serde_json::from_value(crawl.return_value.unwrap()).unwrap();
        assert_eq!(summary.document_ids.len(), 3);
        let ingest = engine
            .queue()
            .wait_until_finished(&summary.batch_job_id, WAIT)
            .await
            .unwrap();
        let ingest: IngestSummary = serde_json::from_value(ingest.return_value.unwrap()).unwrap();
        assert_eq!(ingest.ingested, 3);

        let documents = datastore.records(RecordKind::Document);
        assert_eq!(documents.len(), 3);
        assert!(documents.iter().all(|d| d.str_field("status") == Some("completed")));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_fully_failed_batch_reports_each_document() {
        let datastore = Arc::new(MemoryDatastore::new());
        let a = create_document(&datastore, "bot-5", "https://example.com/gone-a").await;
        let b = create_document(&datastore, "bot-5", "https://example.com/gone-b").await;
        let scraper = FakeScraper::broken(&["https://example.com/gone-a", "https://example.com/gone-b"]);

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .with_scraper(Arc::new(scraper))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let handle = engine
            .ingest(&BatchIngestPayload {
                chatbot_id: "bot-5".into(),
                document_ids: vec![a.id.clone(), b.id.clone()],
                batch_size: None,
            })
            .await
            .unwrap();
        let job = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();

        let summary: IngestSummary = serde_json::from_value(job.return_value.unwrap()).unwrap();
        assert_eq!(summary.failed, 2);
        for failure in &summary.failures {
            assert!(failure.reason.contains("no text content"), "{}", failure.reason);
        }
        assert!(summary.failures.iter().any(|f| f.reason.contains("gone-a")));
        assert!(summary.failures.iter().any(|f| f.reason.contains("gone-b")));
        assert_eq!(
            engine.breakers().get("webFlow:bot-5").snapshot().consecutive_failures,
            1
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_chat_insights_are_stored() {
        let datastore = Arc::new(MemoryDatastore::new());
        let chat = datastore
            .create(RecordKind::Chat, "bot-1", fields(json!({"title": "Pricing question"})))
            .await
            .unwrap();

        let engine = IngestEngine::builder(test_config(), datastore.clone())
            .with_insights(Arc::new(FakeInsights))
            .build()
            .await
            .unwrap();
        engine.start().await.unwrap();

        let handle = engine
            .queue()
            .enqueue(
                "insights-once",
                &ChatInsightsPayload {
                    chatbot_id: "bot-1".into(),
                    chat_id: chat.id.clone(),
                },
                JobOptions::new(),
            )
            .await
            .unwrap();
        let job = engine
            .queue()
            .wait_until_finished(&handle.id, WAIT)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Completed);

        let stored = datastore.get(&chat.id).unwrap();
        assert_eq!(stored.field("resolved"), Some(&json!(true)));
        assert_eq!(stored.field("topics"), Some(&json!(["pricing"])));
        assert_eq!(stored.str_field("title"), Some("Pricing question"));
        engine.stop().await;
    }
}
