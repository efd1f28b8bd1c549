//! In-process collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value};
use tracing::debug;

use super::collaborators::{Datastore, IndexInvalidator};
use super::records::{Record, RecordKind};
use crate::{Error, Result};

/// Datastore kept in memory, keyed by record id.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    records: DashMap<String, Record>,
    updates: AtomicUsize,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as is, replacing any record with the same id.
    pub fn insert(&self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Records of one kind, oldest first.
    pub fn records(&self, kind: RecordKind) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Number of successful `update` calls.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn find(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        Ok(self
            .records
            .get(id)
            .filter(|r| r.kind == kind)
            .map(|r| r.clone()))
    }

    async fn update(
        &self,
        kind: RecordKind,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record> {
        let mut record = self
            .records
            .get_mut(id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| Error::not_found(kind.as_str(), id))?;
        record.fields.extend(fields);
        record.updated_at = Utc::now();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }

    async fn create(
        &self,
        kind: RecordKind,
        chatbot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record> {
        let record = Record::new(kind, chatbot_id, fields);
        self.records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn create_with_id(
        &self,
        kind: RecordKind,
        id: &str,
        chatbot_id: &str,
        fields: Map<String, Value>,
    ) -> Result<Record> {
        match self.records.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::validation(format!("{} {} already exists", kind, id))),
            Entry::Vacant(slot) => {
                let record = Record::new(kind, chatbot_id, fields).with_id(id);
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }
}

/// Invalidator for deployments without a search index.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexInvalidator;

#[async_trait]
impl IndexInvalidator for NoopIndexInvalidator {
    async fn invalidate(&self, chatbot_id: &str, kind: RecordKind, record_id: &str) -> Result<()> {
        debug!(chatbot_id, kind = %kind, record_id, "Index invalidation skipped");
        Ok(())
    }
}
