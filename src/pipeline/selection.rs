//! Tool selection stage and scatter/gather coordinator
//!
//! On `tool.selection` the fixed tool set is scattered as one
//! `data.retrieval` event per tool and a [`PendingAggregation`] is recorded
//! for the session. Each `data.retrieval.completed` is appended in arrival
//! order; once the count reaches the number of scattered tools, exactly one
//! `response.generation` is published and the entry is removed.
//!
//! Completion is decided by count alone. A tool that never reports back
//! leaves the session pending forever unless an aggregation deadline is
//! configured, in which case the partial results are emitted as a degraded
//! response.
//!
//! A scatter that cannot publish all of its retrievals drops its entry. A
//! completed gather whose `response.generation` is rejected stays pending,
//! so a configured deadline can still emit it.

use super::{require_session, ORIGINAL_QUERY};
use crate::bus::{EventHandler, Publisher};
use crate::classifier::risk_level_for;
use crate::models::{
    DataRetrievalPayload, Event, EventType, Metadata, ResponseGenerationPayload,
    RetrievalCompletedPayload, SelectedTool, ToolResult, ToolSelectionPayload,
};
use crate::tools::select_tools;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// In-flight gather for one session
#[derive(Debug, Clone)]
pub struct PendingAggregation {
    pub aggregation_id: Uuid,
    pub session_id: String,
    pub selected_tools: Vec<SelectedTool>,
    pub partial_results: Vec<ToolResult>,
    pub expected_count: usize,
    pub metadata: Metadata,
}

impl PendingAggregation {
    fn is_complete(&self) -> bool {
        self.partial_results.len() >= self.expected_count
    }

    fn into_response(self, degraded: bool) -> ResponseGenerationPayload {
        ResponseGenerationPayload {
            session_id: self.session_id,
            retrieval_results: self.partial_results,
            metadata: self.metadata,
            degraded,
        }
    }
}

type PendingTable = Arc<Mutex<HashMap<String, PendingAggregation>>>;

pub struct ToolSelectionHandler {
    pending: PendingTable,
    deadline: Option<Duration>,
}

impl ToolSelectionHandler {
    pub fn new(deadline: Option<Duration>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            deadline,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, session_id: &str) -> bool {
        self.pending.lock().await.contains_key(session_id)
    }

    async fn scatter(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        let Some(session_id) = require_session(event, self.name()) else {
            return Ok(());
        };
        let selection: ToolSelectionPayload = event.decode_payload()?;

        let query = selection
            .metadata
            .get(ORIGINAL_QUERY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let risk_level = selection
            .intent_result
            .entities
            .get("risk_level")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| risk_level_for(selection.intent_result.label).to_string());

        let tools = select_tools(&risk_level, query);
        let aggregation_id = Uuid::new_v4();

        {
            let mut pending = self.pending.lock().await;
            let previous = pending.insert(
                session_id.to_string(),
                PendingAggregation {
                    aggregation_id,
                    session_id: session_id.to_string(),
                    selected_tools: tools.clone(),
                    partial_results: Vec::with_capacity(tools.len()),
                    expected_count: tools.len(),
                    metadata: selection.metadata.clone(),
                },
            );

            if let Some(previous) = previous {
                warn!(
                    session_id,
                    orphaned_results = previous.partial_results.len(),
                    "New scatter replaced an unfinished aggregation"
                );
            }
        }

        info!(
            session_id,
            %aggregation_id,
            tools = ?tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Scattering retrieval requests"
        );

        for (sent, tool) in tools.iter().enumerate() {
            let payload = DataRetrievalPayload {
                session_id: session_id.to_string(),
                tool_name: tool.name.clone(),
                parameters: tool.parameters.clone(),
                priority: tool.priority,
            };
            if let Err(e) = publisher.publish(
                EventType::DataRetrieval,
                &payload,
                self.name(),
                Some(session_id),
            ) {
                // A partial scatter can never reach its expected count
                self.abandon(session_id, aggregation_id).await;
                error!(
                    session_id,
                    %aggregation_id,
                    sent,
                    expected = tools.len(),
                    error = %e,
                    "Scatter aborted, aggregation dropped"
                );
                return Err(e);
            }
        }

        if let Some(deadline) = self.deadline {
            tokio::spawn(expire_after(
                Arc::clone(&self.pending),
                publisher.clone(),
                session_id.to_string(),
                aggregation_id,
                deadline,
            ));
        }

        Ok(())
    }

    async fn gather(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        let Some(session_id) = require_session(event, self.name()) else {
            return Ok(());
        };
        let completed: RetrievalCompletedPayload = event.decode_payload()?;

        let finished = {
            let mut pending = self.pending.lock().await;
            let Some(aggregation) = pending.get_mut(session_id) else {
                warn!(
                    session_id,
                    tool = %completed.tool_name,
                    "Retrieval result for a session with no pending aggregation"
                );
                return Ok(());
            };

            aggregation.partial_results.push(completed.results);
            debug!(
                session_id,
                tool = %completed.tool_name,
                received = aggregation.partial_results.len(),
                expected = aggregation.expected_count,
                "Gathered retrieval result"
            );

            if aggregation.is_complete() {
                pending.remove(session_id)
            } else {
                None
            }
        };

        let Some(aggregation) = finished else {
            return Ok(());
        };

        info!(
            session_id,
            aggregation_id = %aggregation.aggregation_id,
            results = aggregation.partial_results.len(),
            "All retrieval results gathered"
        );

        let response = aggregation.clone().into_response(false);
        if let Err(e) = publisher.publish(
            EventType::ResponseGeneration,
            &response,
            self.name(),
            Some(session_id),
        ) {
            error!(
                session_id,
                aggregation_id = %aggregation.aggregation_id,
                error = %e,
                "Could not publish gathered results, keeping aggregation pending"
            );
            self.pending
                .lock()
                .await
                .entry(session_id.to_string())
                .or_insert(aggregation);
            return Err(e);
        }
        Ok(())
    }

    /// Remove the entry for `session_id` if it still belongs to `aggregation_id`
    async fn abandon(&self, session_id: &str, aggregation_id: Uuid) {
        let mut pending = self.pending.lock().await;
        if pending
            .get(session_id)
            .is_some_and(|a| a.aggregation_id == aggregation_id)
        {
            pending.remove(session_id);
        }
    }
}

#[async_trait]
impl EventHandler for ToolSelectionHandler {
    fn name(&self) -> &'static str {
        "tool_selection"
    }

    async fn handle(&self, event: &Event, publisher: &Publisher) -> Result<()> {
        match event.event_type {
            EventType::ToolSelection => self.scatter(event, publisher).await,
            EventType::DataRetrievalCompleted => self.gather(event, publisher).await,
            other => {
                debug!(event_type = %other, "Ignoring event");
                Ok(())
            }
        }
    }
}

/// Force-emit whatever has been gathered once the deadline passes.
/// A newer scatter for the same session carries a different id and is left alone.
async fn expire_after(
    pending: PendingTable,
    publisher: Publisher,
    session_id: String,
    aggregation_id: Uuid,
    deadline: Duration,
) {
    tokio::time::sleep(deadline).await;

    let expired = {
        let mut table = pending.lock().await;
        match table.get(&session_id) {
            Some(aggregation) if aggregation.aggregation_id == aggregation_id => {
                table.remove(&session_id)
            }
            _ => None,
        }
    };

    let Some(aggregation) = expired else {
        return;
    };

    warn!(
        session_id = %session_id,
        %aggregation_id,
        received = aggregation.partial_results.len(),
        expected = aggregation.expected_count,
        "Aggregation deadline passed, emitting degraded response"
    );

    if let Err(e) = publisher.publish(
        EventType::ResponseGeneration,
        &aggregation.into_response(true),
        "tool_selection",
        Some(&session_id),
    ) {
        warn!(session_id = %session_id, error = %e, "Could not publish degraded response");
    }
}
