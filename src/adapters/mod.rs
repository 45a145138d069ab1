//! Chat platform adapters
//!
//! [`AdapterManager`] turns inbound platform messages into `chat.message`
//! events and routes each `chat.response` back to the adapter named by the
//! platform segment of its session id.

use crate::bus::{EventHandler, Publisher};
use crate::models::{
    ChatMessagePayload, ChatResponsePayload, ConversationTurn, Event, EventType, Metadata,
    MessageRole, SessionEventPayload,
};
use crate::pipeline::CONVERSATION_HISTORY;
use crate::state::{platform_from_session_id, SessionInfo, SessionStore};
use crate::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Outbound side of one chat platform
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn platform(&self) -> &str;
    async fn send_response(&self, response: &ChatResponsePayload) -> Result<()>;
}

pub struct AdapterManager {
    adapters: RwLock<HashMap<String, Arc<dyn ChatAdapter>>>,
    sessions: Arc<dyn SessionStore>,
    publisher: Publisher,
    history_limit: usize,
}

impl AdapterManager {
    pub fn new(sessions: Arc<dyn SessionStore>, publisher: Publisher, history_limit: usize) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            sessions,
            publisher,
            history_limit,
        }
    }

    pub async fn register_adapter(&self, adapter: Arc<dyn ChatAdapter>) {
        let platform = adapter.platform().to_string();
        info!(platform = %platform, "Registered chat adapter");
        self.adapters.write().await.insert(platform, adapter);
    }

    pub async fn platforms(&self) -> Vec<String> {
        self.adapters.read().await.keys().cloned().collect()
    }

    /// Publish an inbound platform message into the pipeline.
    /// Reuses the user's most recent session on that platform or opens a new one.
    pub async fn process_incoming_message(
        &self,
        platform: &str,
        user_id: &str,
        text: &str,
    ) -> Result<String> {
        let session = self.session_for(platform, user_id).await?;
        let session_id = session.session_id;

        let history = self
            .sessions
            .recent_history(&session_id, self.history_limit)
            .await?;
        self.sessions.touch_session(&session_id).await?;
        self.sessions
            .append_message(&session_id, ConversationTurn::new(MessageRole::User, text))
            .await?;

        let mut metadata = Metadata::new();
        if !history.is_empty() {
            metadata.insert(CONVERSATION_HISTORY.into(), json!(history));
        }

        let payload = ChatMessagePayload {
            platform: platform.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.clone(),
            text: text.to_string(),
            metadata,
        };
        self.publisher.publish(
            EventType::ChatMessage,
            &payload,
            self.name(),
            Some(&session_id),
        )?;

        info!(session_id = %session_id, platform, "Forwarded platform message");
        Ok(session_id)
    }

    async fn session_for(&self, platform: &str, user_id: &str) -> Result<SessionInfo> {
        let existing = self
            .sessions
            .user_sessions(user_id)
            .await?
            .into_iter()
            .filter(|s| s.platform == platform)
            .max_by_key(|s| s.last_activity);

        if let Some(session) = existing {
            return Ok(session);
        }

        let session = self.sessions.create_session(user_id, platform).await?;
        let created = SessionEventPayload {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            platform: session.platform.clone(),
        };
        if let Err(e) = self.publisher.publish(
            EventType::SessionCreated,
            &created,
            self.name(),
            Some(&session.session_id),
        ) {
            warn!(error = %e, "Could not publish session.created");
        }
        Ok(session)
    }
}

#[async_trait]
impl EventHandler for AdapterManager {
    fn name(&self) -> &'static str {
        "adapter_manager"
    }

    async fn handle(&self, event: &Event, _publisher: &Publisher) -> Result<()> {
        let response: ChatResponsePayload = event.decode_payload()?;
        let platform = platform_from_session_id(&response.session_id);

        let adapter = self.adapters.read().await.get(platform).cloned();
        let Some(adapter) = adapter else {
            warn!(platform, session_id = %response.session_id, "No adapter for platform");
            return Ok(());
        };

        if let Err(e) = self
            .sessions
            .append_message(
                &response.session_id,
                ConversationTurn::new(MessageRole::Assistant, response.response_text.clone()),
            )
            .await
        {
            warn!(session_id = %response.session_id, error = %e, "Could not record reply");
        }

        adapter.send_response(&response).await
    }
}

/// Prints replies to stdout and forwards them to a channel
pub struct ConsoleAdapter {
    replies: mpsc::UnboundedSender<ChatResponsePayload>,
}

impl ConsoleAdapter {
    pub const PLATFORM: &'static str = "console";

    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatResponsePayload>) {
        let (replies, receiver) = mpsc::unbounded_channel();
        (Self { replies }, receiver)
    }
}

#[async_trait]
impl ChatAdapter for ConsoleAdapter {
    fn platform(&self) -> &str {
        Self::PLATFORM
    }

    async fn send_response(&self, response: &ChatResponsePayload) -> Result<()> {
        println!("\n=== RESPONSE ({}) ===", response.session_id);
        println!("{}", response.response_text);
        if !response.recommendations.is_empty() {
            println!("\nRecommendations:");
            for (i, rec) in response.recommendations.iter().enumerate() {
                println!(
                    "  {}: {} ({} risk, {})",
                    i + 1,
                    rec.name,
                    rec.risk_level,
                    rec.expected_return
                );
            }
        }
        println!(
            "\nSources: {} | {:.2}s{}",
            response.sources.join(", "),
            response.processing_time,
            if response.degraded { " | degraded" } else { "" }
        );

        // Receiver may already be gone once the demo has its answer
        let _ = self.replies.send(response.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::state::InMemorySessionStore;
    use crate::test_support::{next_event, Collector};
    use std::time::Duration;

    fn response_for(session_id: &str) -> ChatResponsePayload {
        ChatResponsePayload {
            session_id: session_id.to_string(),
            response_text: "hello".to_string(),
            recommendations: vec![],
            confidence: 0.88,
            sources: vec![],
            processing_time: 0.1,
            timestamp: chrono::Utc::now(),
            metadata: Metadata::new(),
            degraded: false,
        }
    }

    #[tokio::test]
    async fn test_incoming_message_reuses_session_and_carries_history() {
        let bus = EventBus::new(32, Duration::from_millis(20));
        let (collector, mut rx) = Collector::new();
        bus.subscribe(EventType::ChatMessage, collector).await;
        bus.start().await.unwrap();

        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::default());
        let manager = AdapterManager::new(Arc::clone(&sessions), bus.publisher(), 3);

        let first = manager
            .process_incoming_message("console", "u1", "hi")
            .await
            .unwrap();
        let second = manager
            .process_incoming_message("console", "u1", "safe funds?")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("console_u1_"));

        let event = next_event(&mut rx, Duration::from_secs(2)).await.unwrap();
        let payload: ChatMessagePayload = event.decode_payload().unwrap();
        assert!(payload.metadata.get(CONVERSATION_HISTORY).is_none());

        let event = next_event(&mut rx, Duration::from_secs(2)).await.unwrap();
        let payload: ChatMessagePayload = event.decode_payload().unwrap();
        assert_eq!(payload.text, "safe funds?");
        assert_eq!(payload.metadata[CONVERSATION_HISTORY][0]["content"], json!("hi"));

        let session = sessions.get_session(&first).await.unwrap().unwrap();
        assert_eq!(session.message_count, 2);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_response_routed_by_platform_segment() {
        let bus = EventBus::new(8, Duration::from_millis(20));
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::default());
        let manager = AdapterManager::new(Arc::clone(&sessions), bus.publisher(), 3);

        let (console, mut replies) = ConsoleAdapter::new();
        manager.register_adapter(Arc::new(console)).await;
        assert_eq!(manager.platforms().await, vec!["console".to_string()]);

        let session = sessions.create_session("u1", "console").await.unwrap();
        let event = Event::new(
            EventType::ChatResponse,
            &response_for(&session.session_id),
            "test",
            None,
        )
        .unwrap();
        manager.handle(&event, &bus.publisher()).await.unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.response_text, "hello");
        let history = sessions.recent_history(&session.session_id, 3).await.unwrap();
        assert_eq!(history[0].role, MessageRole::Assistant);

        // Unknown platform is logged and ignored
        let event = Event::new(
            EventType::ChatResponse,
            &response_for("discord_u1_abcdef12"),
            "test",
            None,
        )
        .unwrap();
        tokio_test::assert_ok!(manager.handle(&event, &bus.publisher()).await);
        assert!(replies.try_recv().is_err());
    }
}
