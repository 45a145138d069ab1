//! Core data models for the event pipeline

use crate::error::PipelineError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque key/value map carried unchanged between stages
pub type Metadata = Map<String, Value>;

//
// ================= Event Types =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    #[serde(rename = "chat.message")]
    ChatMessage,
    #[serde(rename = "chat.response")]
    ChatResponse,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.ended")]
    SessionEnded,
    #[serde(rename = "intent.analysis")]
    IntentAnalysis,
    #[serde(rename = "tool.selection")]
    ToolSelection,
    #[serde(rename = "data.retrieval")]
    DataRetrieval,
    #[serde(rename = "data.retrieval.completed")]
    DataRetrievalCompleted,
    #[serde(rename = "response.generation")]
    ResponseGeneration,
    #[serde(rename = "error")]
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatMessage => "chat.message",
            EventType::ChatResponse => "chat.response",
            EventType::SessionCreated => "session.created",
            EventType::SessionEnded => "session.ended",
            EventType::IntentAnalysis => "intent.analysis",
            EventType::ToolSelection => "tool.selection",
            EventType::DataRetrieval => "data.retrieval",
            EventType::DataRetrievalCompleted => "data.retrieval.completed",
            EventType::ResponseGeneration => "response.generation",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Event Envelope =================
//

/// Immutable envelope passed between stages.
///
/// The payload is always a JSON object; stage handlers decode it into the
/// typed payload structs below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Metadata,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new<P: Serialize>(
        event_type: EventType,
        payload: &P,
        source: &str,
        correlation_id: Option<&str>,
    ) -> Result<Self> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                return Err(PipelineError::MalformedEvent(format!(
                    "{} payload must be a JSON object, got {}",
                    event_type, other
                )))
            }
        };

        Ok(Self {
            event_type,
            payload,
            timestamp: Utc::now(),
            source: source.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        })
    }

    /// Session id carried in the payload, if any
    pub fn session_id(&self) -> Option<&str> {
        self.payload
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Decode the payload into a stage-specific struct
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            PipelineError::MalformedEvent(format!("invalid {} payload: {}", self.event_type, e))
        })
    }

    /// Encode to the JSON transport/log form
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

//
// ================= Stage Payloads =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub platform: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(alias = "message_text")]
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentAnalysisPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(alias = "message_text")]
    pub text: String,
    pub platform: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    GrowthInvestment,
    CapitalPreservation,
    Diversification,
    ProductListing,
    GeneralAdvice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentResult {
    pub label: IntentLabel,
    pub confidence: f32,
    #[serde(default)]
    pub entities: Metadata,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelectionPayload {
    pub session_id: String,
    pub intent_result: IntentResult,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedTool {
    pub name: String,
    pub parameters: Value,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRetrievalPayload {
    pub session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalCompletedPayload {
    pub session_id: String,
    pub tool_name: String,
    pub results: ToolResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseGenerationPayload {
    pub session_id: String,
    pub retrieval_results: Vec<ToolResult>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Set when a gather deadline fired before every tool reported back
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponsePayload {
    pub session_id: String,
    pub response_text: String,
    pub recommendations: Vec<Recommendation>,
    pub confidence: f32,
    pub sources: Vec<String>,
    pub processing_time: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_type: String,
    pub error_message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEventPayload {
    pub session_id: String,
    pub user_id: String,
    pub platform: String,
}

//
// ================= Retrieval =================
//

/// Product record returned by a retrieval collaborator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRecord {
    pub product_id: String,
    pub name: String,
    pub risk_level: String,
    pub expected_return: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f32,
}

/// Opaque unit produced by one retrieval call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub source: String,
    pub results: Vec<ProductRecord>,
    #[serde(default)]
    pub metadata: Metadata,
    pub confidence: f32,
    pub processing_time: f64,
}

//
// ================= Products =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialProduct {
    pub product_id: String,
    pub name: String,
    pub product_type: String,
    pub risk_level: RiskLevel,
    pub description: String,
    pub issuer: String,
    pub expected_return: String,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub minimum_investment: f64,
    pub expense_ratio: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub product_id: String,
    pub name: String,
    pub risk_level: String,
    pub expected_return: String,
    pub confidence: f32,
}

//
// ================= Conversation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}
