//! Ingestion domain: records, collaborators, payloads and queue handlers.

pub mod collaborators;
pub mod flows;
pub mod handlers;
pub mod http;
pub mod memory;
pub mod payloads;
pub mod records;

pub use collaborators::{
    ChatInsights, CrawlProgressFn, Crawler, Datastore, IndexInvalidator, InsightGenerator,
    Scraper, ScreenshotService,
};
pub use flows::{document_flow, product_screenshot_flow};
pub use http::{HttpCrawler, HttpScraper};
pub use memory::{MemoryDatastore, NoopIndexInvalidator};
pub use payloads::*;
pub use records::{FieldShape, IMMUTABLE_FIELDS, Record, RecordKind, validate_update};
