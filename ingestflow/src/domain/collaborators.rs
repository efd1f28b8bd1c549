//! External collaborators consumed by the domain handlers.
//!
//! The engine only depends on these traits; datastore, fetchers, screenshot
//! capture and the LLM envelope live outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::records::{Record, RecordKind};
use crate::Result;
use crate::progress::CrawlProgress;

/// Progress callback handed to a crawler.
pub type CrawlProgressFn = dyn Fn(CrawlProgress) + Send + Sync;

#[async_trait]
pub trait Datastore: Send + Sync {
    /// `None` for a missing row.
    async fn find(&self, kind: RecordKind, id: &str) -> Result<Option<Record>>;

    /// Apply a partial field set and return the updated record.
    async fn update(&self, kind: RecordKind, id: &str, fields: Map<String, Value>)
    -> Result<Record>;

    async fn create(
        &self,
        kind: RecordKind,
        chatbot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record>;

    /// Create a record under a caller-chosen id. Fails if the id is taken.
    async fn create_with_id(
        &self,
        kind: RecordKind,
        id: &str,
        chatbot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record>;
}

#[async_trait]
pub trait Crawler: Send + Sync {
    /// Discover up to `max_links` URLs starting at `start_url`.
    async fn crawl(
        &self,
        start_url: &str,
        max_links: usize,
        on_progress: &CrawlProgressFn,
    ) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Scraper: Send + Sync {
    /// Extracted text content of one page.
    async fn scrape(&self, url: &str) -> Result<String>;
}

#[async_trait]
pub trait ScreenshotService: Send + Sync {
    /// Capture `url` and return where the image was stored.
    async fn capture(&self, url: &str) -> Result<String>;
}

/// Output of the insight generator for one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatInsights {
    pub summary: String,
    pub sentiment: String,
    pub topics: Vec<String>,
    pub resolved: bool,
}

impl ChatInsights {
    /// Chat update derived from these insights.
    pub fn to_update(&self) -> Value {
        json!({
            "summary": self.summary,
            "sentiment": self.sentiment,
            "topics": self.topics,
            "resolved": self.resolved,
            "insights": self,
        })
    }
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(&self, chat: &Record) -> Result<ChatInsights>;
}

/// Drops cached search/answer state for a chatbot after its content changed.
#[async_trait]
pub trait IndexInvalidator: Send + Sync {
    async fn invalidate(&self, chatbot_id: &str, kind: RecordKind, record_id: &str) -> Result<()>;
}
