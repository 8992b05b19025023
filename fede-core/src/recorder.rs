//! Conversation recorder: an analytics sink for finished exchanges.
//!
//! `record` never fails the caller; a store error is logged and dropped.
//! Reads (history, stats) and the rating update do surface errors.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{FedeError, FedeResult};
use crate::models::{ConversationTurn, SessionStats};
use crate::store::ConversationStore;

pub const MAX_HISTORY_LIMIT: usize = 200;

pub struct ConversationRecorder {
    store: Arc<dyn ConversationStore>,
}

impl ConversationRecorder {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Persist a turn. Returns whether it was stored.
    pub async fn record(&self, turn: &ConversationTurn) -> bool {
        match self.store.insert(turn).await {
            Ok(()) => {
                tracing::debug!(
                    id = %turn.id,
                    session_id = %turn.session_id,
                    outcome = turn.outcome.as_str(),
                    ms = turn.processing_time_ms,
                    "Recorded conversation turn"
                );
                true
            }
            Err(e) => {
                tracing::warn!(id = %turn.id, error = %e, "Failed to record conversation turn");
                false
            }
        }
    }

    /// Rate a turn (1-5). Only the turn's owner may rate it.
    pub async fn rate(&self, id: Uuid, user_id: Uuid, rating: i16, feedback: Option<&str>) -> FedeResult<()> {
        if !(1..=5).contains(&rating) {
            return Err(FedeError::invalid("rating must be between 1 and 5"));
        }
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());
        if !self.store.set_rating(id, user_id, rating, feedback).await? {
            return Err(FedeError::not_found(format!("conversation {}", id)));
        }
        Ok(())
    }

    pub async fn history(&self, user_id: Uuid, session_id: Option<Uuid>, limit: usize) -> FedeResult<Vec<ConversationTurn>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.store.history(user_id, session_id, limit).await
    }

    pub async fn session_stats(&self, session_id: Uuid, user_id: Uuid) -> FedeResult<SessionStats> {
        let turns = self.store.for_session(session_id).await?;
        if turns.iter().any(|t| t.user_id != user_id) {
            return Err(FedeError::not_found(format!("session {}", session_id)));
        }
        Ok(SessionStats::from_turns(&turns))
    }
}
