use serde::{Deserialize, Serialize};

/// Progress value of a job: a percentage or a structured status object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Percent(f64),
    Structured(serde_json::Value),
}

impl Default for JobProgress {
    fn default() -> Self {
        JobProgress::Percent(0.0)
    }
}

impl JobProgress {
    /// Percentage clamped to 0..=100.
    pub fn percent(value: f64) -> Self {
        let value = if value.is_finite() { value } else { 0.0 };
        JobProgress::Percent(value.clamp(0.0, 100.0))
    }

    /// Percentage of `done` out of `total`. An empty total counts as done.
    pub fn fraction(done: usize, total: usize) -> Self {
        if total == 0 {
            return JobProgress::Percent(100.0);
        }
        Self::percent(done as f64 / total as f64 * 100.0)
    }

    pub fn structured<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(JobProgress::Structured(serde_json::to_value(value)?))
    }

    pub fn as_percent(&self) -> Option<f64> {
        match self {
            JobProgress::Percent(p) => Some(*p),
            JobProgress::Structured(_) => None,
        }
    }
}

impl From<f64> for JobProgress {
    fn from(value: f64) -> Self {
        JobProgress::percent(value)
    }
}

/// Structured progress reported while crawling a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlProgress {
    pub current: usize,
    pub total: usize,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_document_url: Option<String>,
}

impl CrawlProgress {
    pub fn new(current: usize, total: usize, status: impl Into<String>) -> Self {
        Self {
            current,
            total,
            status: status.into(),
            current_document_url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.current_document_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        assert_eq!(JobProgress::fraction(0, 4), JobProgress::Percent(0.0));
        assert_eq!(JobProgress::fraction(1, 4), JobProgress::Percent(25.0));
        assert_eq!(JobProgress::fraction(4, 4), JobProgress::Percent(100.0));
        assert_eq!(JobProgress::fraction(0, 0), JobProgress::Percent(100.0));
        assert_eq!(JobProgress::percent(140.0), JobProgress::Percent(100.0));
        assert_eq!(JobProgress::percent(f64::NAN), JobProgress::Percent(0.0));
    }

    #[test]
    fn test_crawl_progress_wire_shape() {
        let progress = CrawlProgress::new(3, 10, "crawling").with_url("https://example.com/a");
        let json = serde_json::to_value(JobProgress::structured(&progress).unwrap()).unwrap();
        assert_eq!(json["current"], 3);
        assert_eq!(json["total"], 10);
        assert_eq!(json["status"], "crawling");
        assert_eq!(json["currentDocumentUrl"], "https://example.com/a");

        let number: JobProgress = serde_json::from_str("42.5").unwrap();
        assert_eq!(number.as_percent(), Some(42.5));
    }
}
