use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;
use crate::domain::collaborators::{Scraper, ScreenshotService};
use crate::domain::payloads::{ScrapePayload, ScreenshotPayload};
use crate::queue::{JobContext, JobHandler};

/// Document update produced by a scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedContent {
    pub content: String,
    pub char_count: usize,
    pub status: String,
}

pub struct ScrapeHandler {
    scraper: Arc<dyn Scraper>,
}

impl ScrapeHandler {
    pub fn new(scraper: Arc<dyn Scraper>) -> Self {
        Self { scraper }
    }
}

#[async_trait]
impl JobHandler for ScrapeHandler {
    type Payload = ScrapePayload;
    type Output = ScrapedContent;

    async fn handle(&self, payload: ScrapePayload, ctx: &JobContext) -> Result<ScrapedContent> {
        let content = self.scraper.scrape(&payload.url).await?;
        ctx.update_progress(100.0).await?;
        info!(
            job_id = %ctx.job_id(),
            document_id = %payload.document_id,
            chars = content.chars().count(),
            "Scraped document"
        );
        Ok(ScrapedContent {
            char_count: content.chars().count(),
            content,
            status: "completed".to_string(),
        })
    }
}

/// Product update produced by a screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotResult {
    pub screenshot_url: String,
}

pub struct ScreenshotHandler {
    screenshots: Arc<dyn ScreenshotService>,
}

impl ScreenshotHandler {
    pub fn new(screenshots: Arc<dyn ScreenshotService>) -> Self {
        Self { screenshots }
    }
}

#[async_trait]
impl JobHandler for ScreenshotHandler {
    type Payload = ScreenshotPayload;
    type Output = ScreenshotResult;

    async fn handle(&self, payload: ScreenshotPayload, ctx: &JobContext) -> Result<ScreenshotResult> {
        let screenshot_url = self.screenshots.capture(&payload.url).await?;
        info!(
            job_id = %ctx.job_id(),
            product_id = %payload.product_id,
            screenshot_url = %screenshot_url,
            "Captured screenshot"
        );
        Ok(ScreenshotResult { screenshot_url })
    }
}
