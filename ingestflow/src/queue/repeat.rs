//! Repeatable job definitions driven by cron patterns.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::resilience::BackoffPolicy;
use crate::{Error, Result};

/// A registered recurring job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatDefinition {
    pub key: String,
    pub queue: String,
    pub name: String,
    pub pattern: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout_secs: Option<u64>,
    /// Id of the instance that will produce the next successor, if any.
    pub next_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parse a six-field cron pattern (seconds first).
pub fn parse_pattern(pattern: &str) -> Result<Schedule> {
    let fields = pattern.split_whitespace().count();
    if fields != 6 {
        return Err(Error::validation(format!(
            "cron pattern '{}' must have 6 fields (sec min hour day month weekday), got {}",
            pattern, fields
        )));
    }
    Schedule::from_str(pattern)
        .map_err(|e| Error::validation(format!("invalid cron pattern '{}': {}", pattern, e)))
}

/// Next fire time strictly after `after`.
pub fn next_run(pattern: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_pattern(pattern)?
        .after(&after)
        .next()
        .ok_or_else(|| Error::validation(format!("cron pattern '{}' never fires", pattern)))
}

/// Job id of the instance scheduled for `run_at`.
pub fn instance_id(key: &str, run_at: DateTime<Utc>) -> String {
    format!("repeat:{}:{}", key, run_at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_next_run_daily_pattern() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = next_run("0 15 3 * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 15, 0).unwrap());
    }

    #[test]
    fn test_next_run_every_second() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = next_run("* * * * * *", after).unwrap();
        assert_eq!(next.second(), 1);
    }

    #[test]
    fn test_rejects_five_field_and_garbage() {
        assert!(matches!(parse_pattern("15 3 * * *"), Err(Error::Validation(_))));
        assert!(matches!(parse_pattern("a b c d e f"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_instance_id() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        assert_eq!(instance_id("insights", at), "repeat:insights:1700000000000");
    }
}
