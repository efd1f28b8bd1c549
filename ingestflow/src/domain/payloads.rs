//! One payload type per queue.

use serde::{Deserialize, Serialize};

use super::records::RecordKind;
use crate::queue::JobPayload;
use crate::{Error, Result};

pub const CRAWL_QUEUE: &str = "crawl";
pub const SCRAPE_QUEUE: &str = "scrape";
pub const SCREENSHOT_QUEUE: &str = "screenshot";
pub const UPDATE_RECORD_QUEUE: &str = "update-record";
pub const BATCH_INGEST_QUEUE: &str = "batch-ingest";
pub const CHAT_INSIGHTS_QUEUE: &str = "chat-insights";

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

fn require_web_url(field: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value)
        .map_err(|e| Error::validation(format!("{} is not a valid URL: {}", field, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation(format!(
            "{} must start with http:// or https://",
            field
        )));
    }
    Ok(())
}

/// Crawl a site and ingest what it links to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlPayload {
    pub chatbot_id: String,
    pub start_url: String,
    pub max_links: usize,
}

impl JobPayload for CrawlPayload {
    const QUEUE: &'static str = CRAWL_QUEUE;

    fn validate(&self) -> Result<()> {
        require("chatbotId", &self.chatbot_id)?;
        require_web_url("startUrl", &self.start_url)?;
        if self.max_links == 0 {
            return Err(Error::validation("maxLinks must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapePayload {
    pub document_id: String,
    pub url: String,
}

impl JobPayload for ScrapePayload {
    const QUEUE: &'static str = SCRAPE_QUEUE;

    fn validate(&self) -> Result<()> {
        require("documentId", &self.document_id)?;
        require_web_url("url", &self.url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotPayload {
    pub product_id: String,
    pub url: String,
}

impl JobPayload for ScreenshotPayload {
    const QUEUE: &'static str = SCREENSHOT_QUEUE;

    fn validate(&self) -> Result<()> {
        require("productId", &self.product_id)?;
        require_web_url("url", &self.url)
    }
}

/// Flow parent merging one child's output into a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecordPayload {
    pub kind: RecordKind,
    pub record_id: String,
    pub chatbot_id: String,
    /// `queue:name` of the child whose value is merged.
    pub child_key: String,
}

impl JobPayload for UpdateRecordPayload {
    const QUEUE: &'static str = UPDATE_RECORD_QUEUE;

    fn validate(&self) -> Result<()> {
        require("recordId", &self.record_id)?;
        require("chatbotId", &self.chatbot_id)?;
        match self.child_key.split_once(':') {
            Some((queue, name)) if !queue.is_empty() && !name.is_empty() => Ok(()),
            _ => Err(Error::validation(format!(
                "childKey '{}' must be of the form queue:name",
                self.child_key
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchIngestPayload {
    pub chatbot_id: String,
    pub document_ids: Vec<String>,
    /// Overrides the configured batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl JobPayload for BatchIngestPayload {
    const QUEUE: &'static str = BATCH_INGEST_QUEUE;

    fn validate(&self) -> Result<()> {
        require("chatbotId", &self.chatbot_id)?;
        if self.batch_size == Some(0) {
            return Err(Error::validation("batchSize must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInsightsPayload {
    pub chatbot_id: String,
    pub chat_id: String,
}

impl JobPayload for ChatInsightsPayload {
    const QUEUE: &'static str = CHAT_INSIGHTS_QUEUE;

    fn validate(&self) -> Result<()> {
        require("chatbotId", &self.chatbot_id)?;
        require("chatId", &self.chat_id)
    }
}
