//! Knowledge ranker.
//!
//! Over-fetches `top_k * overfetch_factor` neighbours in one store call, drops
//! anything below `min_confidence` on its raw cosine similarity, boosts
//! category matches by a fixed multiplier and returns at most `top_k` items.
//!
//! Invariants:
//! * no returned candidate has similarity below `min_confidence`;
//! * within one boost class, higher similarity always ranks higher (priority
//!   and usage only break exact ties);
//! * an empty result is a normal outcome meaning "no relevant knowledge".

use std::sync::Arc;

use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::error::FedeResult;
use crate::models::{Category, KnowledgeItem, KnowledgeSource};
use crate::store::{KnowledgeStore, SearchFilter};

#[derive(Debug, Clone)]
pub struct RankOptions {
    pub top_k: usize,
    pub min_confidence: f32,
    pub category_hint: Option<Category>,
}

impl RankOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            min_confidence: config.min_confidence,
            category_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<Category>) -> Self {
        self.category_hint = hint;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCandidate {
    pub item: KnowledgeItem,
    /// Raw cosine similarity to the query.
    pub similarity: f32,
    /// Similarity after the category boost; the sort key.
    pub score: f32,
}

impl RankedCandidate {
    pub fn source(&self) -> KnowledgeSource {
        KnowledgeSource {
            id: self.item.id,
            title: self.item.title.clone(),
            category: self.item.category.clone(),
            content_type: self.item.content_type,
            score: self.similarity,
        }
    }
}

pub struct KnowledgeRanker {
    store: Arc<dyn KnowledgeStore>,
    overfetch_factor: usize,
    category_boost: f32,
}

impl KnowledgeRanker {
    pub fn new(store: Arc<dyn KnowledgeStore>, config: &RetrievalConfig) -> Self {
        Self {
            store,
            overfetch_factor: config.overfetch_factor.max(1),
            category_boost: config.category_boost,
        }
    }

    /// Rank knowledge for a query vector. Store failures propagate.
    pub async fn rank(&self, query: &[f32], options: &RankOptions) -> FedeResult<Vec<RankedCandidate>> {
        if options.top_k == 0 {
            return Ok(Vec::new());
        }

        let fetch = options.top_k.saturating_mul(self.overfetch_factor);
        let hits = self.store.search(query, fetch, &SearchFilter::default()).await?;
        let fetched = hits.len();

        let candidates: Vec<RankedCandidate> = hits
            .into_iter()
            .filter(|h| h.item.is_active && h.item.embedding.is_some())
            .filter_map(|h| {
                let similarity = h.similarity();
                if similarity < options.min_confidence {
                    return None;
                }
                let boosted = matches!(&options.category_hint, Some(c) if *c == h.item.category);
                let score = if boosted {
                    similarity * self.category_boost
                } else {
                    similarity
                };
                Some(RankedCandidate {
                    item: h.item,
                    similarity,
                    score,
                })
            })
            .collect();

        let ranked = order_candidates(candidates, options.top_k);

        tracing::debug!(
            fetched = fetched,
            kept = ranked.len(),
            top_k = options.top_k,
            min_confidence = options.min_confidence,
            "Ranked knowledge"
        );

        Ok(ranked)
    }
}

/// Sort by boosted score, then priority, then least usage; keep `top_k`.
pub fn order_candidates(mut candidates: Vec<RankedCandidate>, top_k: usize) -> Vec<RankedCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.item.priority.cmp(&a.item.priority))
            .then_with(|| a.item.usage_count.cmp(&b.item.usage_count))
    });
    candidates.truncate(top_k);
    candidates
}
