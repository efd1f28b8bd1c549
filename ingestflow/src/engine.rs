//! Ingestion engine.
//!
//! Wires the queue, handler registry, flow producer, circuit breakers, event
//! bus and worker pool together and registers the domain handlers whose
//! collaborators were provided.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::Result;
use crate::config::EngineConfig;
use crate::domain::collaborators::{
    Crawler, Datastore, IndexInvalidator, InsightGenerator, Scraper, ScreenshotService,
};
use crate::domain::handlers::{
    BatchIngestHandler, ChatInsightsHandler, CrawlHandler, ScrapeHandler, ScreenshotHandler,
    UpdateRecordHandler,
};
use crate::domain::memory::NoopIndexInvalidator;
use crate::domain::payloads::{BatchIngestPayload, ChatInsightsPayload, CrawlPayload};
use crate::events::{EventBus, JobSubscription};
use crate::flow::FlowProducer;
use crate::queue::{
    FileJobStore, JobHandle, JobHandler, JobOptions, JobQueue, JobStore, QueueRegistry,
    RepeatOptions, WorkerPool,
};
use crate::resilience::CircuitBreakerRegistry;

/// Collects collaborators before the engine is built.
pub struct IngestEngineBuilder {
    config: EngineConfig,
    datastore: Arc<dyn Datastore>,
    invalidator: Arc<dyn IndexInvalidator>,
    crawler: Option<Arc<dyn Crawler>>,
    scraper: Option<Arc<dyn Scraper>>,
    screenshots: Option<Arc<dyn ScreenshotService>>,
    insights: Option<Arc<dyn InsightGenerator>>,
    store: Option<Arc<dyn JobStore>>,
}

impl IngestEngineBuilder {
    pub fn with_invalidator(mut self, invalidator: Arc<dyn IndexInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    pub fn with_crawler(mut self, crawler: Arc<dyn Crawler>) -> Self {
        self.crawler = Some(crawler);
        self
    }

    pub fn with_scraper(mut self, scraper: Arc<dyn Scraper>) -> Self {
        self.scraper = Some(scraper);
        self
    }

    pub fn with_screenshots(mut self, screenshots: Arc<dyn ScreenshotService>) -> Self {
        self.screenshots = Some(screenshots);
        self
    }

    pub fn with_insights(mut self, insights: Arc<dyn InsightGenerator>) -> Self {
        self.insights = Some(insights);
        self
    }

    /// Persist jobs through `store`. Takes precedence over `queue.store_dir`.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<IngestEngine> {
        self.config.validate()?;

        let events = EventBus::new(self.config.events.capacity);
        let store = match (self.store, &self.config.queue.store_dir) {
            (Some(store), _) => Some(store),
            (None, Some(dir)) => {
                Some(Arc::new(FileJobStore::open(dir).await?) as Arc<dyn JobStore>)
            }
            (None, None) => None,
        };
        let queue = Arc::new(match store {
            Some(store) => JobQueue::with_store(self.config.queue.clone(), events.clone(), store),
            None => JobQueue::new(self.config.queue.clone(), events.clone()),
        });

        let breakers = Arc::new(CircuitBreakerRegistry::from_config(&self.config.breaker));
        let flows = Arc::new(FlowProducer::new(queue.clone()));
        let registry = Arc::new(QueueRegistry::new());

        registry.register(UpdateRecordHandler::new(
            self.datastore.clone(),
            self.invalidator.clone(),
        ))?;
        registry.register(BatchIngestHandler::new(
            self.datastore.clone(),
            flows.clone(),
            breakers.clone(),
            self.config.batch.clone(),
            self.config.workers.job_timeout(),
        ))?;
        if let Some(scraper) = self.scraper {
            registry.register(ScrapeHandler::new(scraper))?;
        }
        if let Some(screenshots) = self.screenshots {
            registry.register(ScreenshotHandler::new(screenshots))?;
        }
        if let Some(crawler) = self.crawler {
            registry.register(CrawlHandler::new(
                crawler,
                self.datastore.clone(),
                breakers.clone(),
            ))?;
        }
        if let Some(insights) = self.insights {
            registry.register(ChatInsightsHandler::new(
                self.datastore.clone(),
                insights,
                self.invalidator.clone(),
            ))?;
        }

        Ok(IngestEngine {
            workers: WorkerPool::new(self.config.workers.clone()),
            config: self.config,
            events,
            queue,
            registry,
            flows,
            breakers,
            started: AtomicBool::new(false),
        })
    }
}

pub struct IngestEngine {
    config: EngineConfig,
    events: EventBus,
    queue: Arc<JobQueue>,
    registry: Arc<QueueRegistry>,
    flows: Arc<FlowProducer>,
    breakers: Arc<CircuitBreakerRegistry>,
    workers: WorkerPool,
    started: AtomicBool,
}

impl IngestEngine {
    pub fn builder(config: EngineConfig, datastore: Arc<dyn Datastore>) -> IngestEngineBuilder {
        IngestEngineBuilder {
            config,
            datastore,
            invalidator: Arc::new(NoopIndexInvalidator),
            crawler: None,
            scraper: None,
            screenshots: None,
            insights: None,
            store: None,
        }
    }

    /// Register an additional handler. Must happen before [`IngestEngine::start`].
    pub fn register<H: JobHandler>(&self, handler: H) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            warn!("Handler registered after start, its queue has no workers");
        }
        self.registry.register(handler)
    }

    /// Recover persisted jobs and start the workers.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Ingest engine already started");
            return Ok(());
        }

        let recovered = self.queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "Recovered jobs from store");
        }

        self.workers.start(self.queue.clone(), self.registry.clone());
        info!(queues = ?self.registry.queues(), "Ingest engine started");
        Ok(())
    }

    /// Stop the workers and wait for them. Interrupted jobs go back to waiting.
    pub async fn stop(&self) {
        self.workers.stop().await;
        info!("Ingest engine stopped");
    }

    /// Enqueue a site crawl.
    pub async fn crawl(&self, payload: &CrawlPayload) -> Result<JobHandle> {
        self.queue
            .enqueue(&format!("crawl-{}", payload.chatbot_id), payload, JobOptions::new())
            .await
    }

    /// Enqueue ingestion of existing documents.
    pub async fn ingest(&self, payload: &BatchIngestPayload) -> Result<JobHandle> {
        self.queue
            .enqueue(&format!("ingest-{}", payload.chatbot_id), payload, JobOptions::new())
            .await
    }

    /// Generate insights for a chat on a cron schedule. Idempotent per chat.
    pub async fn schedule_chat_insights(
        &self,
        payload: &ChatInsightsPayload,
        pattern: &str,
    ) -> Result<JobHandle> {
        let options = JobOptions::new().with_repeat(RepeatOptions::new(
            format!("chat-insights:{}", payload.chat_id),
            pattern,
        ));
        self.queue
            .enqueue(&format!("insights-{}", payload.chat_id), payload, options)
            .await
    }

    /// Events of one job until the subscription is dropped.
    pub fn subscribe(&self, job_id: &str) -> JobSubscription {
        self.events.subscribe_job(job_id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn flows(&self) -> &Arc<FlowProducer> {
        &self.flows
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }
}
