//! Knowledge ingestion and maintenance.
//!
//! Embeddings are computed synchronously on ingest and on edits that touch the
//! title or content. If the provider is unavailable the item is still stored,
//! with a null embedding, and stays out of ranking until `reembed_pending`
//! succeeds for it.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FedeError, FedeResult};
use crate::gateway::EmbeddingGateway;
use crate::models::{KnowledgeItem, KnowledgePatch, KnowledgeSummary, NewKnowledge};
use crate::store::{KnowledgeStore, ListFilter};

/// Upper bound on one `reembed_pending` batch.
pub const MAX_REEMBED_BATCH: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub item: KnowledgeSummary,
    pub embedded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReembedReport {
    pub processed: usize,
    pub embedded: usize,
    pub failed: usize,
}

pub struct KnowledgeIngestor {
    store: Arc<dyn KnowledgeStore>,
    gateway: Arc<EmbeddingGateway>,
    clock: Arc<dyn Clock>,
}

fn validate(item: &KnowledgeItem) -> FedeResult<()> {
    if item.title.is_empty() {
        return Err(FedeError::invalid("title cannot be empty"));
    }
    if item.title.chars().count() > 255 {
        return Err(FedeError::invalid("title is limited to 255 characters"));
    }
    if item.content.is_empty() {
        return Err(FedeError::invalid("content cannot be empty"));
    }
    if !(1..=10).contains(&item.priority) {
        return Err(FedeError::invalid("priority must be between 1 and 10"));
    }
    Ok(())
}

impl KnowledgeIngestor {
    pub fn new(store: Arc<dyn KnowledgeStore>, gateway: Arc<EmbeddingGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { store, gateway, clock }
    }

    /// Embed `item` in place. Returns the failure reason, if any.
    async fn embed_item(&self, item: &mut KnowledgeItem) -> Option<String> {
        match self.gateway.embed_uncached(&item.embedding_text()).await {
            Ok(v) => {
                item.embedding = Some(v);
                None
            }
            Err(e) => {
                tracing::warn!(id = %item.id, error = %e, "Embedding failed; item stored without vector");
                item.embedding = None;
                Some(e.to_string())
            }
        }
    }

    pub async fn ingest(&self, input: NewKnowledge) -> FedeResult<IngestOutcome> {
        let mut item = KnowledgeItem::from_new(input, self.clock.now());
        validate(&item)?;

        let embedding_error = self.embed_item(&mut item).await;
        self.store.upsert(&item, None).await?;

        tracing::info!(
            id = %item.id,
            category = %item.category,
            embedded = embedding_error.is_none(),
            "Knowledge item ingested"
        );

        Ok(IngestOutcome {
            embedded: item.embedding.is_some(),
            item: item.summary(),
            embedding_error,
        })
    }

    pub async fn update(&self, id: Uuid, patch: KnowledgePatch) -> FedeResult<IngestOutcome> {
        let mut item = self.get(id).await?;
        let reembed = patch.touches_embedding();
        patch.apply(&mut item);
        validate(&item)?;
        item.updated_at = self.clock.now();

        // A stale vector would rank the item by its old text.
        let embedding_error = if reembed {
            self.embed_item(&mut item).await
        } else {
            None
        };

        self.store.upsert(&item, None).await?;
        let stored = self.get(id).await?;
        Ok(IngestOutcome {
            embedded: stored.embedding.is_some(),
            item: stored.summary(),
            embedding_error,
        })
    }

    pub async fn get(&self, id: Uuid) -> FedeResult<KnowledgeItem> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| FedeError::not_found(format!("knowledge item {}", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> FedeResult<Vec<KnowledgeSummary>> {
        Ok(self
            .store
            .list(filter)
            .await?
            .iter()
            .map(KnowledgeItem::summary)
            .collect())
    }

    /// Soft delete: items are disabled, never removed, since recorded turns
    /// may reference them.
    pub async fn deactivate(&self, id: Uuid) -> FedeResult<()> {
        if !self.store.set_active(id, false, self.clock.now()).await? {
            return Err(FedeError::not_found(format!("knowledge item {}", id)));
        }
        tracing::info!(id = %id, "Knowledge item deactivated");
        Ok(())
    }

    /// Embed up to `limit` items whose embedding is still null.
    pub async fn reembed_pending(&self, limit: usize) -> FedeResult<ReembedReport> {
        let filter = ListFilter {
            missing_embedding: true,
            limit: Some(limit.clamp(1, MAX_REEMBED_BATCH)),
            ..ListFilter::default()
        };
        let pending = self.store.list(&filter).await?;
        let mut report = ReembedReport::default();

        for mut item in pending {
            report.processed += 1;
            match self.embed_item(&mut item).await {
                None => {
                    self.store.upsert(&item, None).await?;
                    report.embedded += 1;
                }
                Some(_) => report.failed += 1,
            }
        }

        tracing::info!(
            processed = report.processed,
            embedded = report.embedded,
            failed = report.failed,
            "Re-embedding pass finished"
        );
        Ok(report)
    }
}
