//! Application-wide error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the job queue to decide whether a failed
/// attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Payload or data-shape problem. Retrying cannot help.
    Validation,
    /// Network, timeout or datastore hiccup.
    Transient,
    /// The circuit breaker refused the call without attempting it.
    CircuitOpen,
    /// Anything else. Treated as transient.
    Internal,
}

impl ErrorKind {
    /// Whether a job failing with this kind should be retried.
    pub fn should_retry(&self) -> bool {
        !matches!(self, ErrorKind::Validation)
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid payload for queue '{queue}': {reason}")]
    InvalidPayload { queue: String, reason: String },

    #[error("Invalid update payload: {0}")]
    InvalidUpdatePayload(String),

    #[error("External call to {service} failed: {message}")]
    TransientExternal { service: String, message: String },

    #[error("Operation '{operation}' timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("Circuit '{key}' is open, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { key: String, retry_after: Duration },

    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    #[error("A handler is already registered for queue '{0}'")]
    DuplicateHandler(String),

    #[error("No handler registered for queue '{0}'")]
    UnknownQueue(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Child job '{key}' failed: {reason}")]
    ChildFailed { key: String, reason: String },

    #[error("No completed value for child '{0}'")]
    MissingChildValue(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_payload(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_update(msg: impl Into<String>) -> Self {
        Self::InvalidUpdatePayload(msg.into())
    }

    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientExternal {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::InvalidPayload { .. }
            | Error::InvalidUpdatePayload(_)
            | Error::DuplicateJob(_)
            | Error::DuplicateHandler(_)
            | Error::UnknownQueue(_)
            | Error::NotFound { .. }
            | Error::InvalidStateTransition { .. }
            | Error::ChildFailed { .. }
            | Error::MissingChildValue(_)
            | Error::Configuration(_)
            | Error::Serialization(_) => ErrorKind::Validation,
            Error::TransientExternal { .. } | Error::Timeout { .. } | Error::Io(_) => {
                ErrorKind::Transient
            }
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether a job attempt failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind().should_retry()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let service = e
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "http".to_string());
        Error::TransientExternal {
            service,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retried() {
        assert!(!Error::validation("bad").is_retryable());
        assert!(!Error::invalid_update("id is not updatable").is_retryable());
        assert!(!Error::invalid_payload("scrape", "missing url").is_retryable());
        assert_eq!(
            Error::invalid_update("x").kind(),
            ErrorKind::Validation,
        );
    }

    #[test]
    fn transient_errors_are_retried() {
        assert!(Error::transient("crawler", "connection reset").is_retryable());
        assert!(
            Error::Timeout {
                operation: "scrape".into(),
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(Error::Other("boom".into()).is_retryable());
    }

    #[test]
    fn circuit_open_is_its_own_kind() {
        let err = Error::CircuitOpen {
            key: "webFlow:bot-1".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("1500ms"));
    }
}
