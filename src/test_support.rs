//! Shared test doubles

use crate::bus::{EventHandler, Publisher};
use crate::error::PipelineError;
use crate::gemini::{CompletionRequest, CompletionService};
use crate::models::{Event, ProductRecord, ToolResult};
use crate::tools::RetrievalTool;
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Forwards every event it receives into a channel
pub struct Collector {
    sender: mpsc::UnboundedSender<Event>,
}

impl Collector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

#[async_trait]
impl EventHandler for Collector {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn handle(&self, event: &Event, _publisher: &Publisher) -> Result<()> {
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

pub async fn next_event(
    receiver: &mut mpsc::UnboundedReceiver<Event>,
    wait: Duration,
) -> Option<Event> {
    tokio::time::timeout(wait, receiver.recv()).await.ok().flatten()
}

/// Completion service that always fails
pub struct FailingCompletion;

#[async_trait]
impl CompletionService for FailingCompletion {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        Err(PipelineError::LlmError("completion service unavailable".to_string()))
    }
}

/// Completion service that echoes a fixed answer and the candidate names
pub struct FixedCompletion(pub &'static str);

#[async_trait]
impl CompletionService for FixedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let names: Vec<&str> = request.products.iter().map(|p| p.name.as_str()).collect();
        Ok(format!("{} [{}]", self.0, names.join(", ")))
    }
}

/// Retrieval tool returning one record tagged with its own name
pub struct StubTool {
    pub tool_name: &'static str,
    pub product_name: &'static str,
    pub delay: Duration,
    pub fail: bool,
}

impl StubTool {
    pub fn new(tool_name: &'static str, product_name: &'static str) -> Self {
        Self {
            tool_name,
            product_name,
            delay: Duration::ZERO,
            fail: false,
        }
    }
}

#[async_trait]
impl RetrievalTool for StubTool {
    fn name(&self) -> &str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        "test stub"
    }

    async fn retrieve(&self, _parameters: &Value) -> Result<ToolResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(PipelineError::RetrievalError(format!("{} is down", self.tool_name)));
        }
        Ok(stub_result(self.tool_name, self.product_name))
    }
}

pub fn stub_result(source: &str, product_name: &str) -> ToolResult {
    ToolResult {
        source: source.to_string(),
        results: vec![ProductRecord {
            product_id: format!("{}-{}", source, product_name),
            name: product_name.to_string(),
            risk_level: "low".to_string(),
            expected_return: "4-6%".to_string(),
            description: "stub".to_string(),
            confidence: 0.9,
        }],
        metadata: Map::new(),
        confidence: 0.9,
        processing_time: 0.01,
    }
}
