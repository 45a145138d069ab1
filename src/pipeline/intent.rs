//! Intent analysis stage: `intent.analysis` -> `tool.selection`

use super::require_session;
use crate::bus::{EventHandler, Publisher};
use crate::classifier::{fallback_intent, IntentClassifier};
use crate::models::{Event, EventType, IntentAnalysisPayload, ToolSelectionPayload};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct IntentAnalysisHandler {
    classifier: Arc<dyn IntentClassifier>,
}

impl IntentAnalysisHandler {
    pub fn new(classifier: Arc<dyn IntentClassifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl EventHandler for IntentAnalysisHandler {
    fn name(&self) -> &'static str {
        "intent_analysis"
    }

    async fn handle(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        let Some(session_id) = require_session(event, self.name()) else {
            return Ok(());
        };
        let request: IntentAnalysisPayload = event.decode_payload()?;

        let intent_result = match self.classifier.classify(&request.text).await {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id, error = %e, "Intent classification failed, using fallback");
                fallback_intent(&e.to_string())
            }
        };

        info!(
            session_id,
            label = ?intent_result.label,
            confidence = intent_result.confidence,
            "Intent classified"
        );

        let payload = ToolSelectionPayload {
            session_id: session_id.to_string(),
            intent_result,
            metadata: request.metadata,
        };

        publisher.publish(
            EventType::ToolSelection,
            &payload,
            self.name(),
            Some(session_id),
        )
    }
}
