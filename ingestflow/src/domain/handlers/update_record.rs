use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::domain::collaborators::{Datastore, IndexInvalidator};
use crate::domain::payloads::UpdateRecordPayload;
use crate::domain::records::{Record, validate_update};
use crate::queue::{JobContext, JobHandler};
use crate::{Error, Result};

/// Flow parent that merges one child's value into a record.
///
/// The child is selected by the key named in the payload. The value is checked
/// against the record's allow-list before anything is written, and the index is
/// invalidated only after the write went through.
pub struct UpdateRecordHandler {
    datastore: Arc<dyn Datastore>,
    invalidator: Arc<dyn IndexInvalidator>,
}

impl UpdateRecordHandler {
    pub fn new(datastore: Arc<dyn Datastore>, invalidator: Arc<dyn IndexInvalidator>) -> Self {
        Self {
            datastore,
            invalidator,
        }
    }
}

#[async_trait]
impl JobHandler for UpdateRecordHandler {
    type Payload = UpdateRecordPayload;
    type Output = Record;

    async fn handle(&self, payload: UpdateRecordPayload, ctx: &JobContext) -> Result<Record> {
        let children = ctx.children_values()?;
        let value = children.completed(&payload.child_key)?;
        let fields = validate_update(payload.kind, value)?;

        let existing = self
            .datastore
            .find(payload.kind, &payload.record_id)
            .await?
            .ok_or_else(|| Error::not_found(payload.kind.as_str(), &payload.record_id))?;
        if existing.chatbot_id != payload.chatbot_id {
            return Err(Error::validation(format!(
                "{} {} does not belong to chatbot {}",
                payload.kind, payload.record_id, payload.chatbot_id
            )));
        }

        let field_count = fields.len();
        let record = self
            .datastore
            .update(payload.kind, &payload.record_id, fields)
            .await?;
        self.invalidator
            .invalidate(&record.chatbot_id, record.kind, &record.id)
            .await?;

        info!(
            job_id = %ctx.job_id(),
            kind = %record.kind,
            record_id = %record.id,
            fields = field_count,
            "Updated record from child result"
        );
        Ok(record)
    }
}
