//! Storage traits for knowledge, footers and recorded conversations.
//!
//! Two implementations: `postgres` (pgvector, the production store) and
//! `memory` (tests and `backend = "memory"` deployments). Counter updates are
//! atomic in both: a single `UPDATE ... SET usage_count = usage_count + 1` in
//! Postgres, a single locked mutation in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::FedeResult;
use crate::models::{Category, ConversationTurn, FooterTemplate, KnowledgeItem};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryConversationStore, MemoryFooterStore, MemoryKnowledgeStore};
pub use postgres::{PgConversationStore, PgFooterStore, PgKnowledgeStore};

/// Restricts a nearest-neighbour search.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub active_only: bool,
    pub category: Option<Category>,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            active_only: true,
            category: None,
        }
    }
}

/// One search result: the item and its cosine distance (`1 - similarity`).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub item: KnowledgeItem,
    pub distance: f32,
}

impl SearchHit {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Listing filter for the knowledge management surface.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub category: Option<Category>,
    pub active: Option<bool>,
    /// Only items whose embedding is still null.
    pub missing_embedding: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Orders hits by distance ascending, then priority descending, then usage
/// ascending.
pub fn compare_hits(a: &SearchHit, b: &SearchHit) -> std::cmp::Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| b.item.priority.cmp(&a.item.priority))
        .then_with(|| a.item.usage_count.cmp(&b.item.usage_count))
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Insert or replace an item. `embedding` overrides the item's own vector
    /// when given.
    async fn upsert(&self, item: &KnowledgeItem, embedding: Option<&[f32]>) -> FedeResult<()>;

    async fn get(&self, id: Uuid) -> FedeResult<Option<KnowledgeItem>>;

    async fn list(&self, filter: &ListFilter) -> FedeResult<Vec<KnowledgeItem>>;

    /// Nearest neighbours by cosine distance. Items without an embedding never
    /// appear.
    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> FedeResult<Vec<SearchHit>>;

    async fn set_active(&self, id: Uuid, active: bool, at: DateTime<Utc>) -> FedeResult<bool>;

    /// Atomically bump `usage_count` and `last_used_at` for each id.
    async fn increment_usage(&self, ids: &[Uuid], at: DateTime<Utc>) -> FedeResult<()>;

    async fn count_active(&self) -> FedeResult<i64>;

    fn backend_name(&self) -> &'static str;
}

#[async_trait]
pub trait FooterStore: Send + Sync {
    async fn list(&self) -> FedeResult<Vec<FooterTemplate>>;

    async fn list_active(&self) -> FedeResult<Vec<FooterTemplate>>;

    async fn get(&self, id: Uuid) -> FedeResult<Option<FooterTemplate>>;

    async fn create(&self, footer: &FooterTemplate) -> FedeResult<()>;

    async fn update(&self, footer: &FooterTemplate) -> FedeResult<bool>;

    async fn delete(&self, id: Uuid) -> FedeResult<bool>;

    /// Atomically increment `usage_count` and set `last_used_at`, returning
    /// the updated template.
    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> FedeResult<Option<FooterTemplate>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert(&self, turn: &ConversationTurn) -> FedeResult<()>;

    async fn get(&self, id: Uuid) -> FedeResult<Option<ConversationTurn>>;

    /// Set rating and feedback on a turn owned by `user_id`. Returns false if
    /// no such turn exists for that user.
    async fn set_rating(
        &self,
        id: Uuid,
        user_id: Uuid,
        rating: i16,
        feedback: Option<&str>,
    ) -> FedeResult<bool>;

    /// Most recent `limit` turns of a session, oldest first.
    async fn recent_for_session(&self, session_id: Uuid, limit: usize) -> FedeResult<Vec<ConversationTurn>>;

    /// The user's most recent `limit` turns, optionally within one session,
    /// oldest first.
    async fn history(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        limit: usize,
    ) -> FedeResult<Vec<ConversationTurn>>;

    /// Every turn of a session, oldest first.
    async fn for_session(&self, session_id: Uuid) -> FedeResult<Vec<ConversationTurn>>;
}
