//! REST API Server for the financial event pipeline
//!
//! A chat request is validated against the session store, published as a
//! `chat.message` event and answered with the `chat.response` carrying the
//! same `request_id`, or 408 once the response timeout passes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventHandler, Publisher};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{
    ChatMessagePayload, ChatResponsePayload, ConversationTurn, Event, EventType, Metadata,
    MessageRole, SessionEventPayload,
};
use crate::pipeline::{
    register_pipeline, PipelineDeps, ToolSelectionHandler, CONVERSATION_HISTORY, REQUEST_ID,
};
use crate::state::SessionStore;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub user_id: String,
    #[serde(alias = "text")]
    pub message_text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn respond<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    (status, Json(ApiResponse::success(data)))
}

fn fail(status: StatusCode, message: impl Into<String>) -> ApiResult {
    (status, Json(ApiResponse::error(message)))
}

/// =============================
/// Response Waiter
/// =============================

/// Hands each `chat.response` to the request that published its message,
/// matched on the `request_id` carried in metadata
#[derive(Default)]
pub struct ResponseWaiter {
    waiting: Mutex<HashMap<String, oneshot::Sender<ChatResponsePayload>>>,
}

impl ResponseWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register before publishing so a fast response is never missed
    pub async fn register(&self, request_id: &str) -> oneshot::Receiver<ChatResponsePayload> {
        let (sender, receiver) = oneshot::channel();
        if self
            .waiting
            .lock()
            .await
            .insert(request_id.to_string(), sender)
            .is_some()
        {
            warn!(request_id, "Replaced an existing response waiter");
        }
        receiver
    }

    pub async fn cancel(&self, request_id: &str) {
        self.waiting.lock().await.remove(request_id);
    }

    pub async fn waiting_count(&self) -> usize {
        self.waiting.lock().await.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for ResponseWaiter {
    fn name(&self) -> &'static str {
        "response_waiter"
    }

    async fn handle(&self, event: &Event, _publisher: &Publisher) -> crate::Result<()> {
        let response: ChatResponsePayload = event.decode_payload()?;
        let Some(request_id) = response.metadata.get(REQUEST_ID).and_then(|v| v.as_str()) else {
            debug!(session_id = %response.session_id, "Response not tied to a REST request");
            return Ok(());
        };

        let waiter = self.waiting.lock().await.remove(request_id);
        match waiter {
            Some(waiter) => {
                if waiter.send(response).is_err() {
                    warn!("Response arrived after the request gave up");
                }
            }
            None => {
                warn!(
                    session_id = %response.session_id,
                    request_id,
                    "Dropping response for a request that is no longer waiting"
                );
            }
        }
        Ok(())
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<dyn SessionStore>,
    pub coordinator: Arc<ToolSelectionHandler>,
    pub waiter: Arc<ResponseWaiter>,
    pub config: Arc<PipelineConfig>,
}

impl ApiState {
    /// Wire the pipeline and response waiter onto a fresh bus and start it
    pub async fn new(
        config: PipelineConfig,
        deps: PipelineDeps,
        sessions: Arc<dyn SessionStore>,
    ) -> crate::Result<Self> {
        let bus = Arc::new(EventBus::from_config(&config));
        let coordinator = register_pipeline(&bus, deps, &config).await;

        let waiter = Arc::new(ResponseWaiter::new());
        bus.subscribe(EventType::ChatResponse, waiter.clone()).await;
        bus.start().await?;

        Ok(Self {
            bus,
            sessions,
            coordinator,
            waiter,
            config: Arc::new(config),
        })
    }

    fn publish_session_event(&self, event_type: EventType, session: &SessionEventPayload) {
        if let Err(e) = self.bus.publish(event_type, session, "api", Some(&session.session_id)) {
            warn!(event_type = %event_type, error = %e, "Could not publish session event");
        }
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let active_sessions = state.sessions.active_session_count().await.unwrap_or_default();

    Json(json!({
        "status": "healthy",
        "bus_running": state.bus.is_running().await,
        "bus": state.bus.stats(),
        "pending_aggregations": state.coordinator.pending_count().await,
        "waiting_requests": state.waiter.waiting_count().await,
        "active_sessions": active_sessions,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Session Endpoints
/// =============================

async fn create_session(
    State(state): State<ApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult {
    match state.sessions.create_session(&req.user_id, &req.platform).await {
        Ok(session) => {
            state.publish_session_event(
                EventType::SessionCreated,
                &SessionEventPayload {
                    session_id: session.session_id.clone(),
                    user_id: session.user_id.clone(),
                    platform: session.platform.clone(),
                },
            );
            respond(StatusCode::CREATED, session)
        }
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_session(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult {
    match state.sessions.get_session(&session_id).await {
        Ok(Some(session)) => respond(StatusCode::OK, session),
        Ok(None) => fail(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn end_session(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult {
    let session = match state.sessions.get_session(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return fail(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    match state.sessions.end_session(&session_id).await {
        Ok(_) => {
            state.publish_session_event(
                EventType::SessionEnded,
                &SessionEventPayload {
                    session_id: session.session_id.clone(),
                    user_id: session.user_id,
                    platform: session.platform,
                },
            );
            respond(StatusCode::OK, json!({ "session_id": session_id, "ended": true }))
        }
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_message(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> ApiResult {
    info!(session_id = %req.session_id, "Received chat message");

    match state.sessions.validate_session(&req.session_id, &req.user_id).await {
        Ok(true) => {}
        Ok(false) => return fail(StatusCode::BAD_REQUEST, "Invalid session"),
        Err(e) => return fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }

    let Some(session) = state.sessions.get_session(&req.session_id).await.ok().flatten() else {
        return fail(StatusCode::BAD_REQUEST, "Invalid session");
    };

    let history = state
        .sessions
        .recent_history(&req.session_id, state.config.conversation_history_limit)
        .await
        .unwrap_or_default();

    let request_id = Uuid::new_v4().to_string();
    let mut metadata = req.metadata;
    metadata.insert(REQUEST_ID.into(), json!(request_id));
    if !history.is_empty() {
        metadata.insert(CONVERSATION_HISTORY.into(), json!(history));
    }

    let payload = ChatMessagePayload {
        platform: session.platform,
        user_id: req.user_id,
        session_id: req.session_id.clone(),
        text: req.message_text.clone(),
        metadata,
    };

    let receiver = state.waiter.register(&request_id).await;

    if let Err(e) = state
        .bus
        .publish(EventType::ChatMessage, &payload, "api", Some(&req.session_id))
    {
        state.waiter.cancel(&request_id).await;
        return match e {
            PipelineError::QueueFull(_) | PipelineError::BusStopped => {
                fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            other => fail(StatusCode::BAD_REQUEST, other.to_string()),
        };
    }

    record_turn(&state, &req.session_id, MessageRole::User, &req.message_text).await;

    match tokio::time::timeout(state.config.response_timeout, receiver).await {
        Ok(Ok(response)) => {
            record_turn(&state, &req.session_id, MessageRole::Assistant, &response.response_text)
                .await;
            respond(StatusCode::OK, response)
        }
        Ok(Err(_)) => fail(StatusCode::SERVICE_UNAVAILABLE, "Response channel closed"),
        Err(_) => {
            state.waiter.cancel(&request_id).await;
            warn!(session_id = %req.session_id, %request_id, "Timed out waiting for response");
            fail(StatusCode::REQUEST_TIMEOUT, "Request timeout")
        }
    }
}

async fn record_turn(state: &ApiState, session_id: &str, role: MessageRole, content: &str) {
    if let Err(e) = state.sessions.touch_session(session_id).await {
        warn!(session_id, error = %e, "Could not update session activity");
    }
    if let Err(e) = state
        .sessions
        .append_message(session_id, ConversationTurn::new(role, content))
        .await
    {
        warn!(session_id, error = %e, "Could not record conversation turn");
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id", get(get_session).delete(end_session))
        .route("/api/chat/message", post(chat_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> crate::Result<()> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::KeywordIntentClassifier;
    use crate::gemini::{CompletionRequest, CompletionService};
    use crate::state::InMemorySessionStore;
    use crate::test_support::{FailingCompletion, StubTool};
    use crate::tools::{create_default_registry, ToolRegistry, STRUCTURED_DB_SEARCH, VECTOR_SEARCH};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state(tools: ToolRegistry, response_timeout: Duration) -> ApiState {
        state_with_completion(tools, Arc::new(FailingCompletion), response_timeout).await
    }

    async fn state_with_completion(
        tools: ToolRegistry,
        completion: Arc<dyn CompletionService>,
        response_timeout: Duration,
    ) -> ApiState {
        let config = PipelineConfig {
            poll_interval: Duration::from_millis(20),
            response_timeout,
            ..PipelineConfig::default()
        };
        let deps = PipelineDeps {
            classifier: Arc::new(KeywordIntentClassifier),
            tools: Arc::new(tools),
            completion,
        };
        ApiState::new(config, deps, Arc::new(InMemorySessionStore::default()))
            .await
            .unwrap()
    }

    /// Answers growth queries only after a long pause
    struct SlowGrowthCompletion;

    #[async_trait::async_trait]
    impl CompletionService for SlowGrowthCompletion {
        async fn complete(&self, request: &CompletionRequest) -> crate::Result<String> {
            if request.query.contains("growth") {
                tokio::time::sleep(Duration::from_millis(700)).await;
                Ok("growth answer".to_string())
            } else {
                Ok("conservative answer".to_string())
            }
        }
    }

    async fn catalog_state() -> ApiState {
        let tools = create_default_registry(&PipelineConfig::default()).unwrap();
        test_state(tools, Duration::from_secs(5)).await
    }

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, ApiResponse) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn open_session(state: &ApiState, user_id: &str) -> String {
        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/api/sessions",
            Some(json!({ "user_id": user_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body.data.unwrap()["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_reports_bus_state() {
        let state = catalog_state().await;
        let response = create_router(state.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["bus_running"], json!(true));
        assert_eq!(body["pending_aggregations"], json!(0));
        state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let state = catalog_state().await;
        let session_id = open_session(&state, "u1").await;
        assert!(session_id.starts_with("api_u1_"));

        let uri = format!("/api/sessions/{}", session_id);
        let (status, body) = call(create_router(state.clone()), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.unwrap()["user_id"], json!("u1"));

        let (status, _) = call(create_router(state.clone()), "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(create_router(state.clone()), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.success);
        state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_chat_message_returns_correlated_response() {
        let state = catalog_state().await;
        let session_id = open_session(&state, "u1").await;

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/api/chat/message",
            Some(json!({
                "session_id": session_id,
                "user_id": "u1",
                "message_text": "I want a high-risk growth investment",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["session_id"], json!(session_id));
        assert!(data["response_text"]
            .as_str()
            .unwrap()
            .contains("Yuanta Growth Fund"));
        assert_eq!(data["sources"].as_array().unwrap().len(), 3);

        let history = state.sessions.recent_history(&session_id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(state.waiter.waiting_count().await, 0);
        state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_chat_message_rejects_invalid_session() {
        let state = catalog_state().await;

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/api/chat/message",
            Some(json!({
                "session_id": "api_u1_00000000",
                "user_id": "u1",
                "message_text": "hi",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error.as_deref(), Some("Invalid session"));
        state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_pipeline_times_out() {
        // No relationship-search tool: the gather never completes
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(StubTool::new(STRUCTURED_DB_SEARCH, "Alpha")));
        tools.register(Arc::new(StubTool::new(VECTOR_SEARCH, "Beta")));
        let state = test_state(tools, Duration::from_millis(500)).await;
        let session_id = open_session(&state, "u1").await;

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/api/chat/message",
            Some(json!({
                "session_id": session_id,
                "user_id": "u1",
                "text": "safe income",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body.error.as_deref(), Some("Request timeout"));
        assert!(state.coordinator.is_pending(&session_id).await);
        assert_eq!(state.waiter.waiting_count().await, 0);
        state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_bus_returns_service_unavailable() {
        let state = catalog_state().await;
        let session_id = open_session(&state, "u1").await;
        state.bus.stop().await;

        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/api/chat/message",
            Some(json!({
                "session_id": session_id,
                "user_id": "u1",
                "message_text": "hi",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_late_response_is_not_handed_to_next_request() {
        let tools = create_default_registry(&PipelineConfig::default()).unwrap();
        let state =
            state_with_completion(tools, Arc::new(SlowGrowthCompletion), Duration::from_millis(500))
                .await;
        let session_id = open_session(&state, "u1").await;

        let (status, _) = call(
            create_router(state.clone()),
            "POST",
            "/api/chat/message",
            Some(json!({
                "session_id": session_id,
                "user_id": "u1",
                "message_text": "I want a high-risk growth investment",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

        // The growth answer lands while this request is waiting
        let (status, body) = call(
            create_router(state.clone()),
            "POST",
            "/api/chat/message",
            Some(json!({
                "session_id": session_id,
                "user_id": "u1",
                "message_text": "something safe and conservative",
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let data = body.data.unwrap();
        assert_eq!(data["response_text"], json!("conservative answer"));
        assert!(data["metadata"][REQUEST_ID].is_string());
        assert_eq!(state.waiter.waiting_count().await, 0);
        state.bus.stop().await;
    }

    #[tokio::test]
    async fn test_waiter_routes_by_request_id() {
        let waiter = ResponseWaiter::new();
        let bus = EventBus::new(4, Duration::from_millis(20));
        let mut first = waiter.register("req-1").await;
        let mut second = waiter.register("req-2").await;

        let mut metadata = Metadata::new();
        metadata.insert(REQUEST_ID.into(), json!("req-2"));
        let response = ChatResponsePayload {
            session_id: "api_u1_00000001".to_string(),
            response_text: "answer".to_string(),
            recommendations: Vec::new(),
            confidence: 0.88,
            sources: Vec::new(),
            processing_time: 0.1,
            timestamp: chrono::Utc::now(),
            metadata,
            degraded: false,
        };
        let event = Event::new(EventType::ChatResponse, &response, "test", Some("api_u1_00000001")).unwrap();

        waiter.handle(&event, &bus.publisher()).await.unwrap();
        assert_eq!(second.try_recv().unwrap().response_text, "answer");
        assert!(first.try_recv().is_err());

        // Cancelling one request leaves the other registered
        waiter.cancel("req-2").await;
        assert_eq!(waiter.waiting_count().await, 1);
        waiter.cancel("req-1").await;
        assert_eq!(waiter.waiting_count().await, 0);
    }
}
