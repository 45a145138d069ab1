//! Message intake stage: `chat.message` -> `intent.analysis`

use super::{require_session, ORIGINAL_QUERY, RECEIVED_AT};
use crate::bus::{EventHandler, Publisher};
use crate::models::{ChatMessagePayload, Event, EventType, IntentAnalysisPayload};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;

pub struct ChatMessageHandler;

#[async_trait]
impl EventHandler for ChatMessageHandler {
    fn name(&self) -> &'static str {
        "chat_message"
    }

    async fn handle(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        let Some(session_id) = require_session(event, self.name()) else {
            return Ok(());
        };
        let message: ChatMessagePayload = event.decode_payload()?;

        info!(
            session_id,
            platform = %message.platform,
            user_id = %message.user_id,
            "Processing chat message"
        );

        let mut metadata = message.metadata;
        metadata
            .entry(ORIGINAL_QUERY)
            .or_insert_with(|| json!(message.text));
        metadata
            .entry(RECEIVED_AT)
            .or_insert_with(|| json!(Utc::now().to_rfc3339()));

        let payload = IntentAnalysisPayload {
            session_id: session_id.to_string(),
            user_id: Some(message.user_id),
            text: message.text,
            platform: message.platform,
            metadata,
        };

        publisher.publish(
            EventType::IntentAnalysis,
            &payload,
            self.name(),
            Some(session_id),
        )
    }
}
