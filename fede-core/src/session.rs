//! Per-session conversation state.
//!
//! Each live session is an `Arc<tokio::sync::Mutex<SessionContext>>`; holding
//! the guard serializes messages of the same session while different sessions
//! proceed in parallel. Idle sessions are evicted lazily on access and rebuilt
//! from recorded turns when they come back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::context::estimate_tokens;
use crate::error::{FedeError, FedeResult};
use crate::models::HistoryMessage;
use crate::store::ConversationStore;

#[derive(Debug)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub user_id: Uuid,
    messages: VecDeque<HistoryMessage>,
    token_estimate: usize,
    max_messages: usize,
    last_active: DateTime<Utc>,
    loaded: bool,
}

impl SessionContext {
    fn new(session_id: Uuid, user_id: Uuid, max_messages: usize, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            user_id,
            messages: VecDeque::new(),
            token_estimate: 0,
            max_messages,
            last_active: now,
            loaded: false,
        }
    }

    fn push(&mut self, message: HistoryMessage) {
        self.token_estimate += estimate_tokens(&message.content);
        self.messages.push_back(message);
        while self.messages.len() > self.max_messages {
            if let Some(old) = self.messages.pop_front() {
                self.token_estimate = self.token_estimate.saturating_sub(estimate_tokens(&old.content));
            }
        }
    }

    /// Append one user/assistant exchange.
    pub fn push_exchange(&mut self, user: &str, assistant: &str, at: DateTime<Utc>) {
        self.push(HistoryMessage::user(user, at));
        self.push(HistoryMessage::assistant(assistant, at));
        self.last_active = at;
    }

    /// History, oldest first.
    pub fn history(&self) -> Vec<HistoryMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }
}

type SessionSlot = Arc<AsyncMutex<SessionContext>>;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionSlot>>,
    store: Arc<dyn ConversationStore>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    max_messages: usize,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ConversationStore>, clock: Arc<dyn Clock>, config: &SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            clock,
            idle_timeout: Duration::seconds(config.idle_timeout_seconds as i64),
            max_messages: config.max_messages.max(2),
        }
    }

    /// Lock a session for one exchange, creating or rebuilding it as needed.
    ///
    /// The returned guard is owned so it can travel into a spawned task.
    pub async fn acquire(&self, session_id: Uuid, user_id: Uuid) -> FedeResult<OwnedMutexGuard<SessionContext>> {
        self.evict_idle();

        let now = self.clock.now();
        let slot = {
            let mut sessions = self.sessions.lock();
            sessions
                .entry(session_id)
                .or_insert_with(|| {
                    Arc::new(AsyncMutex::new(SessionContext::new(
                        session_id,
                        user_id,
                        self.max_messages,
                        now,
                    )))
                })
                .clone()
        };

        let mut guard = slot.lock_owned().await;

        if guard.user_id != user_id {
            return Err(FedeError::not_found(format!("session {}", session_id)));
        }

        if !guard.loaded {
            let turns = self
                .store
                .recent_for_session(session_id, self.max_messages / 2)
                .await?;
            if turns.iter().any(|t| t.user_id != user_id) {
                return Err(FedeError::not_found(format!("session {}", session_id)));
            }
            if !turns.is_empty() {
                tracing::debug!(session_id = %session_id, turns = turns.len(), "Rebuilt session from history");
            }
            for turn in &turns {
                guard.push_exchange(&turn.user_message, &turn.assistant_response, turn.created_at);
            }
            guard.loaded = true;
        }

        guard.last_active = now;
        Ok(guard)
    }

    /// Drop sessions idle for longer than the timeout. A session that is
    /// locked, or whose slot has been handed to an `acquire` still waiting on
    /// the lock, is never evicted.
    pub fn evict_idle(&self) -> usize {
        let cutoff = self.clock.now() - self.idle_timeout;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| {
            // Slots are cloned under the map lock, so this count is exact here.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(ctx) => ctx.last_active >= cutoff,
                Err(_) => true,
            }
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted = evicted, "Evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
