use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::domain::collaborators::{ChatInsights, Datastore, IndexInvalidator, InsightGenerator};
use crate::domain::payloads::ChatInsightsPayload;
use crate::domain::records::{RecordKind, validate_update};
use crate::queue::{JobContext, JobHandler};
use crate::{Error, Result};

/// Generates insights for one chat and stores them on the chat record.
pub struct ChatInsightsHandler {
    datastore: Arc<dyn Datastore>,
    generator: Arc<dyn InsightGenerator>,
    invalidator: Arc<dyn IndexInvalidator>,
}

impl ChatInsightsHandler {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        generator: Arc<dyn InsightGenerator>,
        invalidator: Arc<dyn IndexInvalidator>,
    ) -> Self {
        Self {
            datastore,
            generator,
            invalidator,
        }
    }
}

#[async_trait]
impl JobHandler for ChatInsightsHandler {
    type Payload = ChatInsightsPayload;
    type Output = ChatInsights;

    async fn handle(&self, payload: ChatInsightsPayload, ctx: &JobContext) -> Result<ChatInsights> {
        let chat = self
            .datastore
            .find(RecordKind::Chat, &payload.chat_id)
            .await?
            .ok_or_else(|| Error::not_found("chat", &payload.chat_id))?;

        let insights = self.generator.generate(&chat).await?;
        ctx.update_progress(50.0).await?;

        let fields = validate_update(RecordKind::Chat, &insights.to_update())?;
        self.datastore
            .update(RecordKind::Chat, &chat.id, fields)
            .await?;
        self.invalidator
            .invalidate(&payload.chatbot_id, RecordKind::Chat, &chat.id)
            .await?;

        info!(
            job_id = %ctx.job_id(),
            chat_id = %chat.id,
            resolved = insights.resolved,
            topics = insights.topics.len(),
            "Stored chat insights"
        );
        Ok(insights)
    }
}
