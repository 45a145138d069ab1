//! Session store
//!
//! Tracks conversation sessions and their recent turns.
//! Session ids have the form `platform_userid_suffix` with an 8 hex char
//! suffix, so adapters can recover the platform from the id alone.
//! Currently in-memory; the trait is the seam for a persistent store.

use crate::error::PipelineError;
use crate::models::ConversationTurn;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Turns kept per session
const MAX_TURNS_PER_SESSION: usize = 50;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub platform: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub is_active: bool,
}

/// Trait for session persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, user_id: &str, platform: &str) -> Result<SessionInfo>;
    /// Active session by id; ended sessions are not returned
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>>;
    /// True when the session is active and owned by `user_id`. Refreshes activity.
    async fn validate_session(&self, session_id: &str, user_id: &str) -> Result<bool>;
    /// Record one more message on the session
    async fn touch_session(&self, session_id: &str) -> Result<()>;
    async fn end_session(&self, session_id: &str) -> Result<bool>;
    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>>;
    async fn append_message(&self, session_id: &str, turn: ConversationTurn) -> Result<()>;
    async fn recent_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>>;
    /// End sessions idle for longer than the store timeout; returns how many
    async fn cleanup_expired(&self) -> Result<usize>;
    async fn active_session_count(&self) -> Result<usize>;
}

/// In-memory session store for development
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionInfo>>>,
    sessions_by_user: Arc<RwLock<HashMap<String, Vec<String>>>>,
    conversations: Arc<RwLock<HashMap<String, VecDeque<ConversationTurn>>>>,
    session_timeout: Duration,
}

impl InMemorySessionStore {
    pub fn new(session_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sessions_by_user: Arc::new(RwLock::new(HashMap::new())),
            conversations: Arc::new(RwLock::new(HashMap::new())),
            session_timeout,
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600))
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, user_id: &str, platform: &str) -> Result<SessionInfo> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::SessionError("user_id must not be empty".to_string()));
        }
        if platform.is_empty() || platform.contains('_') {
            return Err(PipelineError::SessionError(format!(
                "invalid platform name: {:?}",
                platform
            )));
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let session_id = format!("{}_{}_{}", platform, user_id, &suffix[..8]);
        let now = Utc::now();

        let session = SessionInfo {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            start_time: now,
            last_activity: now,
            message_count: 0,
            is_active: true,
        };

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session.clone());
        self.sessions_by_user
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .push(session_id.clone());

        info!(session_id = %session_id, user_id, platform, "Created session");
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).filter(|s| s.is_active).cloned())
    }

    async fn validate_session(&self, session_id: &str, user_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.is_active && session.user_id == user_id => {
                session.last_activity = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PipelineError::SessionError(format!("unknown session {}", session_id)))?;

        session.last_activity = Utc::now();
        session.message_count += 1;
        Ok(())
    }

    async fn end_session(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.sessions.write().await.remove(session_id) else {
            return Ok(false);
        };

        {
            let mut by_user = self.sessions_by_user.write().await;
            if let Some(ids) = by_user.get_mut(&session.user_id) {
                ids.retain(|id| id != session_id);
                if ids.is_empty() {
                    by_user.remove(&session.user_id);
                }
            }
        }
        self.conversations.write().await.remove(session_id);

        info!(session_id, "Ended session");
        Ok(true)
    }

    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>> {
        let ids = self
            .sessions_by_user
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default();

        let sessions = self.sessions.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| sessions.get(id))
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn append_message(&self, session_id: &str, turn: ConversationTurn) -> Result<()> {
        if self.get_session(session_id).await?.is_none() {
            return Err(PipelineError::SessionError(format!(
                "cannot record message on inactive session {}",
                session_id
            )));
        }

        let mut conversations = self.conversations.write().await;
        let turns = conversations.entry(session_id.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > MAX_TURNS_PER_SESSION {
            turns.pop_front();
        }
        Ok(())
    }

    async fn recent_history(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(session_id)
            .map(|turns| {
                let skip = turns.len().saturating_sub(limit);
                turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.is_active)
                .filter(|s| {
                    now.signed_duration_since(s.last_activity)
                        .to_std()
                        .map(|idle| idle > self.session_timeout)
                        .unwrap_or(false)
                })
                .map(|s| s.session_id.clone())
                .collect()
        };

        for session_id in &expired {
            self.end_session(session_id).await?;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Cleaned up expired sessions");
        }
        Ok(expired.len())
    }

    async fn active_session_count(&self) -> Result<usize> {
        let sessions = self.sessions.read().await;
        Ok(sessions.values().filter(|s| s.is_active).count())
    }
}

/// Periodically sweep expired sessions until `shutdown` flips to true
pub fn spawn_cleanup(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = store.cleanup_expired().await {
                        error!(error = %e, "Session cleanup failed");
                    }
                }
            }
        }
    })
}

/// Platform segment of a session id, `"unknown"` for ids with fewer than three parts
pub fn platform_from_session_id(session_id: &str) -> &str {
    let parts: Vec<&str> = session_id.split('_').collect();
    if parts.len() >= 3 {
        parts[0]
    } else {
        UNKNOWN
    }
}
