//! Data retrieval stage: `data.retrieval` -> `data.retrieval.completed`
//!
//! A failing or slow tool still reports back with an empty, degraded
//! result so the gather can complete. An unknown tool name is a handler
//! fault and reports nothing.

use super::require_session;
use crate::bus::{EventHandler, Publisher};
use crate::error::PipelineError;
use crate::models::{DataRetrievalPayload, Event, EventType, RetrievalCompletedPayload};
use crate::tools::{degraded_result, ToolRegistry};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct DataRetrievalHandler {
    registry: Arc<ToolRegistry>,
    tool_timeout: Duration,
}

impl DataRetrievalHandler {
    pub fn new(registry: Arc<ToolRegistry>, tool_timeout: Duration) -> Self {
        Self {
            registry,
            tool_timeout,
        }
    }
}

#[async_trait]
impl EventHandler for DataRetrievalHandler {
    fn name(&self) -> &'static str {
        "data_retrieval"
    }

    async fn handle(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        let Some(session_id) = require_session(event, self.name()) else {
            return Ok(());
        };
        let request: DataRetrievalPayload = event.decode_payload()?;

        let tool = self
            .registry
            .get(&request.tool_name)
            .ok_or_else(|| PipelineError::ToolNotFound(request.tool_name.clone()))?;

        let start = Instant::now();
        let results =
            match tokio::time::timeout(self.tool_timeout, tool.retrieve(&request.parameters)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(session_id, tool = %request.tool_name, error = %e, "Retrieval failed");
                    degraded_result(&request.tool_name, &e.to_string(), start.elapsed())
                }
                Err(_) => {
                    warn!(
                        session_id,
                        tool = %request.tool_name,
                        timeout = ?self.tool_timeout,
                        "Retrieval timed out"
                    );
                    degraded_result(&request.tool_name, "retrieval timed out", start.elapsed())
                }
            };

        info!(
            session_id,
            tool = %request.tool_name,
            result_count = results.results.len(),
            "Retrieval completed"
        );

        let payload = RetrievalCompletedPayload {
            session_id: session_id.to_string(),
            tool_name: request.tool_name,
            results,
        };

        publisher.publish(
            EventType::DataRetrievalCompleted,
            &payload,
            self.name(),
            Some(session_id),
        )
    }
}
