//! Response generation stage: `response.generation` -> `chat.response`

use super::{require_session, CONVERSATION_HISTORY, ORIGINAL_QUERY, RECEIVED_AT};
use crate::bus::{EventHandler, Publisher};
use crate::models::{
    ChatResponsePayload, ConversationTurn, Event, EventType, Metadata, ResponseGenerationPayload,
    ToolResult,
};
use crate::synthesis::{
    recommendations_from_products, recommendations_from_results, ResponseSynthesizer,
    RECOMMENDATION_CONFIDENCE,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

pub struct ResponseGenerationHandler {
    synthesizer: ResponseSynthesizer,
}

impl ResponseGenerationHandler {
    pub fn new(synthesizer: ResponseSynthesizer) -> Self {
        Self { synthesizer }
    }
}

#[async_trait]
impl EventHandler for ResponseGenerationHandler {
    fn name(&self) -> &'static str {
        "response_generation"
    }

    async fn handle(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        let Some(session_id) = require_session(event, self.name()) else {
            return Ok(());
        };
        let request: ResponseGenerationPayload = event.decode_payload()?;

        let query = request
            .metadata
            .get(ORIGINAL_QUERY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let history = conversation_history(&request.metadata);

        let synthesis = self.synthesizer.synthesize(&query, history).await;

        let recommendations = if query.trim().is_empty() {
            recommendations_from_results(&request.retrieval_results)
        } else {
            recommendations_from_products(&synthesis.products)
        };

        let mut metadata = request.metadata;
        metadata.insert("product_bucket".into(), json!(synthesis.bucket));
        metadata.insert("used_fallback".into(), json!(synthesis.used_fallback));

        let processing_time = processing_time(&metadata, &request.retrieval_results);

        info!(
            session_id,
            bucket = ?synthesis.bucket,
            used_fallback = synthesis.used_fallback,
            degraded = request.degraded,
            processing_time,
            "Response generated"
        );

        let payload = ChatResponsePayload {
            session_id: session_id.to_string(),
            response_text: synthesis.text,
            recommendations,
            confidence: RECOMMENDATION_CONFIDENCE,
            sources: distinct_sources(&request.retrieval_results),
            processing_time,
            timestamp: Utc::now(),
            metadata,
            degraded: request.degraded,
        };

        publisher.publish(
            EventType::ChatResponse,
            &payload,
            self.name(),
            Some(session_id),
        )
    }
}

fn conversation_history(metadata: &Metadata) -> Option<Vec<ConversationTurn>> {
    metadata
        .get(CONVERSATION_HISTORY)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

/// Distinct retrieval sources in arrival order
fn distinct_sources(results: &[ToolResult]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for result in results {
        if !sources.contains(&result.source) {
            sources.push(result.source.clone());
        }
    }
    sources
}

/// Seconds since intake; summed tool time when intake did not stamp the message
fn processing_time(metadata: &Metadata, results: &[ToolResult]) -> f64 {
    let received_at = metadata
        .get(RECEIVED_AT)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());

    match received_at {
        Some(received_at) => {
            let elapsed = Utc::now().signed_duration_since(received_at.with_timezone(&Utc));
            (elapsed.num_milliseconds().max(0) as f64) / 1000.0
        }
        None => results.iter().map(|r| r.processing_time).sum(),
    }
}
