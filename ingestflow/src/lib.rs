//! ingestflow library crate.
//!
//! Job queue, flow (parent/children) producer, circuit breakers, bounded batch
//! runner and event bus, plus the document ingestion handlers built on them.

pub mod batch;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod resilience;

pub use engine::{IngestEngine, IngestEngineBuilder};
pub use error::{Error, ErrorKind, Result};
