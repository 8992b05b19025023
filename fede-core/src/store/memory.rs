//! In-process stores. Every mutation happens under one lock, so counter
//! increments cannot be lost.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{compare_hits, ConversationStore, FooterStore, KnowledgeStore, ListFilter, SearchFilter, SearchHit};
use crate::embeddings::cosine_similarity;
use crate::error::FedeResult;
use crate::models::{ConversationTurn, FooterTemplate, KnowledgeItem};

#[derive(Default)]
pub struct MemoryKnowledgeStore {
    items: RwLock<HashMap<Uuid, KnowledgeItem>>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn upsert(&self, item: &KnowledgeItem, embedding: Option<&[f32]>) -> FedeResult<()> {
        let mut stored = item.clone();
        if let Some(v) = embedding {
            stored.embedding = Some(v.to_vec());
        }
        let mut items = self.items.write();
        // Counters belong to `increment_usage`; an edit never rewinds them.
        if let Some(existing) = items.get(&stored.id) {
            stored.usage_count = existing.usage_count;
            stored.last_used_at = existing.last_used_at;
        }
        items.insert(stored.id, stored);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> FedeResult<Option<KnowledgeItem>> {
        Ok(self.items.read().get(&id).cloned())
    }

    async fn list(&self, filter: &ListFilter) -> FedeResult<Vec<KnowledgeItem>> {
        let items = self.items.read();
        let mut out: Vec<KnowledgeItem> = items
            .values()
            .filter(|i| filter.category.as_ref().map_or(true, |c| &i.category == c))
            .filter(|i| filter.active.map_or(true, |a| i.is_active == a))
            .filter(|i| !filter.missing_embedding || i.embedding.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> FedeResult<Vec<SearchHit>> {
        let items = self.items.read();
        let mut hits: Vec<SearchHit> = items
            .values()
            .filter(|i| !filter.active_only || i.is_active)
            .filter(|i| filter.category.as_ref().map_or(true, |c| &i.category == c))
            .filter_map(|i| {
                let embedding = i.embedding.as_ref()?;
                if embedding.len() != query.len() {
                    return None;
                }
                Some(SearchHit {
                    distance: 1.0 - cosine_similarity(query, embedding),
                    item: i.clone(),
                })
            })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn set_active(&self, id: Uuid, active: bool, at: DateTime<Utc>) -> FedeResult<bool> {
        let mut items = self.items.write();
        match items.get_mut(&id) {
            Some(item) => {
                item.is_active = active;
                item.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_usage(&self, ids: &[Uuid], at: DateTime<Utc>) -> FedeResult<()> {
        let mut items = self.items.write();
        for id in ids {
            if let Some(item) = items.get_mut(id) {
                item.usage_count += 1;
                item.last_used_at = Some(at);
            }
        }
        Ok(())
    }

    async fn count_active(&self) -> FedeResult<i64> {
        Ok(self.items.read().values().filter(|i| i.is_active).count() as i64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Default)]
pub struct MemoryFooterStore {
    footers: RwLock<HashMap<Uuid, FooterTemplate>>,
}

impl MemoryFooterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut footers: Vec<FooterTemplate>) -> Vec<FooterTemplate> {
        footers.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.probability.cmp(&a.probability))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        footers
    }
}

#[async_trait]
impl FooterStore for MemoryFooterStore {
    async fn list(&self) -> FedeResult<Vec<FooterTemplate>> {
        Ok(Self::sorted(self.footers.read().values().cloned().collect()))
    }

    async fn list_active(&self) -> FedeResult<Vec<FooterTemplate>> {
        Ok(Self::sorted(
            self.footers
                .read()
                .values()
                .filter(|f| f.is_active)
                .cloned()
                .collect(),
        ))
    }

    async fn get(&self, id: Uuid) -> FedeResult<Option<FooterTemplate>> {
        Ok(self.footers.read().get(&id).cloned())
    }

    async fn create(&self, footer: &FooterTemplate) -> FedeResult<()> {
        self.footers.write().insert(footer.id, footer.clone());
        Ok(())
    }

    async fn update(&self, footer: &FooterTemplate) -> FedeResult<bool> {
        let mut footers = self.footers.write();
        match footers.get_mut(&footer.id) {
            Some(existing) => {
                let usage_count = existing.usage_count;
                let last_used_at = existing.last_used_at;
                *existing = footer.clone();
                existing.usage_count = usage_count;
                existing.last_used_at = last_used_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> FedeResult<bool> {
        Ok(self.footers.write().remove(&id).is_some())
    }

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> FedeResult<Option<FooterTemplate>> {
        let mut footers = self.footers.write();
        Ok(footers.get_mut(&id).map(|f| {
            f.usage_count += 1;
            f.last_used_at = Some(at);
            f.clone()
        }))
    }
}

#[derive(Default)]
pub struct MemoryConversationStore {
    turns: RwLock<Vec<ConversationTurn>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep the last `limit` of an already chronological list.
fn tail(mut turns: Vec<ConversationTurn>, limit: usize) -> Vec<ConversationTurn> {
    let skip = turns.len().saturating_sub(limit);
    turns.drain(..skip);
    turns
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn insert(&self, turn: &ConversationTurn) -> FedeResult<()> {
        self.turns.write().push(turn.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> FedeResult<Option<ConversationTurn>> {
        Ok(self.turns.read().iter().find(|t| t.id == id).cloned())
    }

    async fn set_rating(
        &self,
        id: Uuid,
        user_id: Uuid,
        rating: i16,
        feedback: Option<&str>,
    ) -> FedeResult<bool> {
        let mut turns = self.turns.write();
        match turns.iter_mut().find(|t| t.id == id && t.user_id == user_id) {
            Some(turn) => {
                turn.user_rating = Some(rating);
                turn.user_feedback = feedback.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recent_for_session(&self, session_id: Uuid, limit: usize) -> FedeResult<Vec<ConversationTurn>> {
        let turns = self.for_session(session_id).await?;
        Ok(tail(turns, limit))
    }

    async fn history(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        limit: usize,
    ) -> FedeResult<Vec<ConversationTurn>> {
        let mut turns: Vec<ConversationTurn> = self
            .turns
            .read()
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| session_id.map_or(true, |s| t.session_id == s))
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.created_at);
        Ok(tail(turns, limit))
    }

    async fn for_session(&self, session_id: Uuid) -> FedeResult<Vec<ConversationTurn>> {
        let mut turns: Vec<ConversationTurn> = self
            .turns
            .read()
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.created_at);
        Ok(turns)
    }
}
