//! Stage handler chain
//!
//! chat.message -> intent.analysis -> tool.selection -> N x data.retrieval
//! -> N x data.retrieval.completed -> response.generation -> chat.response
//!
//! Every stage publishes with `correlation_id = session_id` and carries the
//! `metadata` map forward untouched.

pub mod intake;
pub mod intent;
pub mod response;
pub mod retrieval;
pub mod selection;

pub use intake::ChatMessageHandler;
pub use intent::IntentAnalysisHandler;
pub use response::ResponseGenerationHandler;
pub use retrieval::DataRetrievalHandler;
pub use selection::{PendingAggregation, ToolSelectionHandler};

use crate::bus::EventBus;
use crate::classifier::IntentClassifier;
use crate::config::PipelineConfig;
use crate::gemini::CompletionService;
use crate::models::{Event, EventType};
use crate::synthesis::ResponseSynthesizer;
use crate::tools::ToolRegistry;
use std::sync::Arc;
use tracing::warn;

/// Metadata key holding the user's free-text query
pub const ORIGINAL_QUERY: &str = "original_query";
/// Metadata key holding the RFC 3339 intake time
pub const RECEIVED_AT: &str = "received_at";
/// Metadata key holding recent conversation turns
pub const CONVERSATION_HISTORY: &str = "conversation_history";
/// Metadata key identifying the REST request a message came from
pub const REQUEST_ID: &str = "request_id";

/// External collaborators the stages call out to
pub struct PipelineDeps {
    pub classifier: Arc<dyn IntentClassifier>,
    pub tools: Arc<ToolRegistry>,
    pub completion: Arc<dyn CompletionService>,
}

/// Subscribe all five stages. Returns the coordinator so callers can
/// inspect pending aggregations.
pub async fn register_pipeline(
    bus: &EventBus,
    deps: PipelineDeps,
    config: &PipelineConfig,
) -> Arc<ToolSelectionHandler> {
    let coordinator = Arc::new(ToolSelectionHandler::new(config.aggregation_deadline));

    bus.subscribe(EventType::ChatMessage, Arc::new(ChatMessageHandler))
        .await;
    bus.subscribe(
        EventType::IntentAnalysis,
        Arc::new(IntentAnalysisHandler::new(deps.classifier)),
    )
    .await;
    bus.subscribe(EventType::ToolSelection, coordinator.clone())
        .await;
    bus.subscribe(
        EventType::DataRetrieval,
        Arc::new(DataRetrievalHandler::new(deps.tools, config.tool_timeout)),
    )
    .await;
    bus.subscribe(EventType::DataRetrievalCompleted, coordinator.clone())
        .await;
    bus.subscribe(
        EventType::ResponseGeneration,
        Arc::new(ResponseGenerationHandler::new(ResponseSynthesizer::new(
            deps.completion,
        ))),
    )
    .await;

    coordinator
}

/// Session id of a stage event; events without one are dropped with a warning
pub(crate) fn require_session<'a>(event: &'a Event, stage: &str) -> Option<&'a str> {
    let session_id = event.session_id();
    if session_id.is_none() {
        warn!(
            stage,
            event_type = %event.event_type,
            source = %event.source,
            "Dropping event without session_id"
        );
    }
    session_id
}
