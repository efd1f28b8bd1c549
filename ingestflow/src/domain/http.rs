//! HTTP crawler and scraper.

use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use super::collaborators::{CrawlProgressFn, Crawler, Scraper};
use crate::config::HttpConfig;
use crate::progress::CrawlProgress;
use crate::{Error, Result};

static SCRIPT_STYLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)\s*>").unwrap()
});
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static HREF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Build the shared client for outbound fetches.
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}

/// Visible text of an HTML page.
pub fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE_REGEX.replace_all(html, " ");
    let without_tags = TAG_REGEX.replace_all(&without_scripts, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    WHITESPACE_REGEX.replace_all(&decoded, " ").trim().to_string()
}

/// Same-origin http(s) links of a page, fragments stripped, in page order.
pub fn extract_links(base: &Url, html: &str) -> Vec<Url> {
    let mut seen = HashSet::new();
    HREF_REGEX
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .filter_map(|href| base.join(href.as_str().trim()).ok())
        .filter_map(|mut link| {
            link.set_fragment(None);
            let same_origin = link.origin() == base.origin();
            let web = matches!(link.scheme(), "http" | "https");
            (same_origin && web && seen.insert(link.to_string())).then_some(link)
        })
        .collect()
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::validation(format!("invalid URL '{}': {}", raw, e)))
}

async fn fetch_html(client: &reqwest::Client, url: &Url) -> Result<String> {
    let response = client.get(url.clone()).send().await?.error_for_status()?;
    Ok(response.text().await?)
}

/// Fetches one page and returns its text.
#[derive(Clone)]
pub struct HttpScraper {
    client: reqwest::Client,
}

impl HttpScraper {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Scraper for HttpScraper {
    async fn scrape(&self, url: &str) -> Result<String> {
        let url = parse_url(url)?;
        let html = fetch_html(&self.client, &url).await?;
        let text = html_to_text(&html);
        if text.is_empty() {
            return Err(Error::validation(format!("no text content at {}", url)));
        }
        debug!(url = %url, chars = text.len(), "Scraped page");
        Ok(text)
    }
}

/// Breadth-first, same-origin link discovery.
#[derive(Clone)]
pub struct HttpCrawler {
    client: reqwest::Client,
}

impl HttpCrawler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    async fn crawl(
        &self,
        start_url: &str,
        max_links: usize,
        on_progress: &CrawlProgressFn,
    ) -> Result<Vec<String>> {
        let start = parse_url(start_url)?;
        let mut discovered = vec![start.to_string()];
        let mut seen: HashSet<String> = discovered.iter().cloned().collect();
        let mut frontier = VecDeque::from([start.clone()]);

        on_progress(CrawlProgress::new(0, max_links, "started").with_url(start.as_str()));

        while let Some(page) = frontier.pop_front() {
            if discovered.len() >= max_links {
                break;
            }

            let html = match fetch_html(&self.client, &page).await {
                Ok(html) => html,
                // The start page has to load, later pages are best-effort.
                Err(e) if page == start => return Err(e),
                Err(e) => {
                    warn!(url = %page, error = %e, "Skipping page that failed to load");
                    continue;
                }
            };

            for link in extract_links(&page, &html) {
                if discovered.len() >= max_links {
                    break;
                }
                if seen.insert(link.to_string()) {
                    discovered.push(link.to_string());
                    frontier.push_back(link);
                }
            }

            on_progress(
                CrawlProgress::new(discovered.len(), max_links, "crawling").with_url(page.as_str()),
            );
        }

        on_progress(CrawlProgress::new(discovered.len(), discovered.len(), "completed"));
        Ok(discovered)
    }
}
