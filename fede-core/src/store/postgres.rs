//! Postgres + pgvector stores.
//!
//! Search orders by the `<=>` cosine distance operator (served by the HNSW
//! index); score = 1 - distance. Counters are incremented in-place with
//! `usage_count = usage_count + 1` so concurrent callers never lose updates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ConversationStore, FooterStore, KnowledgeStore, ListFilter, SearchFilter, SearchHit};
use crate::error::{FedeError, FedeResult};
use crate::models::{
    Category, ConversationTurn, FooterTemplate, FooterType, KnowledgeItem, KnowledgeSource, TurnOutcome,
};

const KNOWLEDGE_COLUMNS: &str = "id, title, content, content_type, category, embedding, tags, priority, \
     is_active, usage_count, last_used_at, source_url, metadata, created_at, updated_at";

const FOOTER_COLUMNS: &str = "id, type, name, template, urls, probability, priority, is_active, notes, \
     usage_count, last_used_at, created_at, updated_at";

const TURN_COLUMNS: &str = "id, session_id, user_id, user_message, assistant_response, knowledge_sources, \
     detected_category, outcome, confidence, was_successful, user_rating, user_feedback, \
     processing_time_ms, created_at";

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct KnowledgeRow {
    id: Uuid,
    title: String,
    content: String,
    content_type: String,
    category: String,
    embedding: Option<Vector>,
    tags: Vec<String>,
    priority: i32,
    is_active: bool,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
    source_url: Option<String>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<KnowledgeRow> for KnowledgeItem {
    type Error = FedeError;

    fn try_from(row: KnowledgeRow) -> Result<Self, Self::Error> {
        Ok(KnowledgeItem {
            id: row.id,
            title: row.title,
            content: row.content,
            content_type: row.content_type.parse().map_err(FedeError::Storage)?,
            category: row.category.parse().map_err(FedeError::Storage)?,
            embedding: row.embedding.map(|v| v.to_vec()),
            tags: row.tags,
            priority: row.priority,
            is_active: row.is_active,
            usage_count: row.usage_count,
            last_used_at: row.last_used_at,
            source_url: row.source_url,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SearchRow {
    #[sqlx(flatten)]
    item: KnowledgeRow,
    distance: f64,
}

#[derive(sqlx::FromRow)]
struct FooterRow {
    id: Uuid,
    #[sqlx(rename = "type")]
    footer_type: String,
    name: String,
    template: String,
    urls: Json<BTreeMap<String, String>>,
    probability: i32,
    priority: i32,
    is_active: bool,
    notes: Option<String>,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FooterRow> for FooterTemplate {
    type Error = FedeError;

    fn try_from(row: FooterRow) -> Result<Self, Self::Error> {
        Ok(FooterTemplate {
            id: row.id,
            footer_type: row.footer_type.parse::<FooterType>().map_err(FedeError::Storage)?,
            name: row.name,
            template: row.template,
            urls: row.urls.0,
            probability: row.probability,
            priority: row.priority,
            is_active: row.is_active,
            notes: row.notes,
            usage_count: row.usage_count,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    id: Uuid,
    session_id: Uuid,
    user_id: Uuid,
    user_message: String,
    assistant_response: String,
    knowledge_sources: Json<Vec<KnowledgeSource>>,
    detected_category: Option<String>,
    outcome: String,
    confidence: Option<f32>,
    was_successful: bool,
    user_rating: Option<i16>,
    user_feedback: Option<String>,
    processing_time_ms: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TurnRow> for ConversationTurn {
    type Error = FedeError;

    fn try_from(row: TurnRow) -> Result<Self, Self::Error> {
        let detected_category = match row.detected_category {
            Some(c) => Some(c.parse::<Category>().map_err(FedeError::Storage)?),
            None => None,
        };
        let outcome = TurnOutcome::parse(&row.outcome)
            .ok_or_else(|| FedeError::Storage(format!("unknown turn outcome '{}'", row.outcome)))?;

        Ok(ConversationTurn {
            id: row.id,
            session_id: row.session_id,
            user_id: row.user_id,
            user_message: row.user_message,
            assistant_response: row.assistant_response,
            knowledge_sources: row.knowledge_sources.0,
            detected_category,
            outcome,
            confidence: row.confidence,
            was_successful: row.was_successful,
            user_rating: row.user_rating,
            user_feedback: row.user_feedback,
            processing_time_ms: row.processing_time_ms,
            created_at: row.created_at,
        })
    }
}

fn convert<R, T>(rows: Vec<R>) -> FedeResult<Vec<T>>
where
    T: TryFrom<R, Error = FedeError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================================
// PgKnowledgeStore
// ============================================================================

#[derive(Clone)]
pub struct PgKnowledgeStore {
    pool: PgPool,
}

impl PgKnowledgeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KnowledgeStore for PgKnowledgeStore {
    async fn upsert(&self, item: &KnowledgeItem, embedding: Option<&[f32]>) -> FedeResult<()> {
        let vector = embedding
            .map(|v| Vector::from(v.to_vec()))
            .or_else(|| item.embedding.clone().map(Vector::from));

        sqlx::query(
            r#"
            INSERT INTO knowledge_items
                (id, title, content, content_type, category, embedding, tags, priority,
                 is_active, usage_count, last_used_at, source_url, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                content_type = EXCLUDED.content_type,
                category = EXCLUDED.category,
                embedding = EXCLUDED.embedding,
                tags = EXCLUDED.tags,
                priority = EXCLUDED.priority,
                is_active = EXCLUDED.is_active,
                source_url = EXCLUDED.source_url,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(item.id)
        .bind(&item.title)
        .bind(&item.content)
        .bind(item.content_type.as_str())
        .bind(item.category.as_str())
        .bind(vector)
        .bind(&item.tags)
        .bind(item.priority)
        .bind(item.is_active)
        .bind(item.usage_count)
        .bind(item.last_used_at)
        .bind(&item.source_url)
        .bind(&item.metadata)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> FedeResult<Option<KnowledgeItem>> {
        let row = sqlx::query_as::<_, KnowledgeRow>(&format!(
            "SELECT {} FROM knowledge_items WHERE id = $1",
            KNOWLEDGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(KnowledgeItem::try_from).transpose()
    }

    async fn list(&self, filter: &ListFilter) -> FedeResult<Vec<KnowledgeItem>> {
        let rows = sqlx::query_as::<_, KnowledgeRow>(&format!(
            r#"
            SELECT {} FROM knowledge_items
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::bool IS NULL OR is_active = $2)
              AND (NOT $3 OR embedding IS NULL)
            ORDER BY priority DESC, created_at DESC
            LIMIT $4 OFFSET $5
            "#,
            KNOWLEDGE_COLUMNS
        ))
        .bind(filter.category.as_ref().map(|c| c.as_str().to_string()))
        .bind(filter.active)
        .bind(filter.missing_embedding)
        .bind(filter.limit.map(|l| l as i64))
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> FedeResult<Vec<SearchHit>> {
        let vector = Vector::from(query.to_vec());

        let rows = sqlx::query_as::<_, SearchRow>(&format!(
            r#"
            SELECT {}, (embedding <=> $1)::float8 AS distance
            FROM knowledge_items
            WHERE embedding IS NOT NULL
              AND (NOT $2 OR is_active)
              AND ($3::text IS NULL OR category = $3)
            ORDER BY embedding <=> $1, priority DESC, usage_count ASC
            LIMIT $4
            "#,
            KNOWLEDGE_COLUMNS
        ))
        .bind(&vector)
        .bind(filter.active_only)
        .bind(filter.category.as_ref().map(|c| c.as_str().to_string()))
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SearchHit {
                    distance: row.distance as f32,
                    item: KnowledgeItem::try_from(row.item)?,
                })
            })
            .collect()
    }

    async fn set_active(&self, id: Uuid, active: bool, at: DateTime<Utc>) -> FedeResult<bool> {
        let result = sqlx::query("UPDATE knowledge_items SET is_active = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(active)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_usage(&self, ids: &[Uuid], at: DateTime<Utc>) -> FedeResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE knowledge_items SET usage_count = usage_count + 1, last_used_at = $2 WHERE id = ANY($1)",
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_active(&self) -> FedeResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM knowledge_items WHERE is_active")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

// ============================================================================
// PgFooterStore
// ============================================================================

#[derive(Clone)]
pub struct PgFooterStore {
    pool: PgPool,
}

impl PgFooterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FooterStore for PgFooterStore {
    async fn list(&self) -> FedeResult<Vec<FooterTemplate>> {
        let rows = sqlx::query_as::<_, FooterRow>(&format!(
            "SELECT {} FROM footer_templates ORDER BY priority DESC, probability DESC, created_at ASC",
            FOOTER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn list_active(&self) -> FedeResult<Vec<FooterTemplate>> {
        let rows = sqlx::query_as::<_, FooterRow>(&format!(
            "SELECT {} FROM footer_templates WHERE is_active \
             ORDER BY priority DESC, probability DESC, created_at ASC",
            FOOTER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn get(&self, id: Uuid) -> FedeResult<Option<FooterTemplate>> {
        let row = sqlx::query_as::<_, FooterRow>(&format!(
            "SELECT {} FROM footer_templates WHERE id = $1",
            FOOTER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FooterTemplate::try_from).transpose()
    }

    async fn create(&self, footer: &FooterTemplate) -> FedeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO footer_templates
                (id, type, name, template, urls, probability, priority, is_active, notes,
                 usage_count, last_used_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(footer.id)
        .bind(footer.footer_type.as_str())
        .bind(&footer.name)
        .bind(&footer.template)
        .bind(Json(&footer.urls))
        .bind(footer.probability)
        .bind(footer.priority)
        .bind(footer.is_active)
        .bind(&footer.notes)
        .bind(footer.usage_count)
        .bind(footer.last_used_at)
        .bind(footer.created_at)
        .bind(footer.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, footer: &FooterTemplate) -> FedeResult<bool> {
        // Counters are owned by `mark_used` and left untouched here.
        let result = sqlx::query(
            r#"
            UPDATE footer_templates SET
                type = $2, name = $3, template = $4, urls = $5, probability = $6,
                priority = $7, is_active = $8, notes = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(footer.id)
        .bind(footer.footer_type.as_str())
        .bind(&footer.name)
        .bind(&footer.template)
        .bind(Json(&footer.urls))
        .bind(footer.probability)
        .bind(footer.priority)
        .bind(footer.is_active)
        .bind(&footer.notes)
        .bind(footer.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> FedeResult<bool> {
        let result = sqlx::query("DELETE FROM footer_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_used(&self, id: Uuid, at: DateTime<Utc>) -> FedeResult<Option<FooterTemplate>> {
        let row = sqlx::query_as::<_, FooterRow>(&format!(
            "UPDATE footer_templates SET usage_count = usage_count + 1, last_used_at = $2 \
             WHERE id = $1 RETURNING {}",
            FOOTER_COLUMNS
        ))
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FooterTemplate::try_from).transpose()
    }
}

// ============================================================================
// PgConversationStore
// ============================================================================

#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn insert(&self, turn: &ConversationTurn) -> FedeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations
                (id, session_id, user_id, user_message, assistant_response, knowledge_sources,
                 detected_category, outcome, confidence, was_successful, user_rating,
                 user_feedback, processing_time_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(turn.id)
        .bind(turn.session_id)
        .bind(turn.user_id)
        .bind(&turn.user_message)
        .bind(&turn.assistant_response)
        .bind(Json(&turn.knowledge_sources))
        .bind(turn.detected_category.as_ref().map(|c| c.as_str().to_string()))
        .bind(turn.outcome.as_str())
        .bind(turn.confidence)
        .bind(turn.was_successful)
        .bind(turn.user_rating)
        .bind(&turn.user_feedback)
        .bind(turn.processing_time_ms)
        .bind(turn.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> FedeResult<Option<ConversationTurn>> {
        let row = sqlx::query_as::<_, TurnRow>(&format!(
            "SELECT {} FROM conversations WHERE id = $1",
            TURN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ConversationTurn::try_from).transpose()
    }

    async fn set_rating(
        &self,
        id: Uuid,
        user_id: Uuid,
        rating: i16,
        feedback: Option<&str>,
    ) -> FedeResult<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET user_rating = $3, user_feedback = $4 WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(rating)
        .bind(feedback)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recent_for_session(&self, session_id: Uuid, limit: usize) -> FedeResult<Vec<ConversationTurn>> {
        let rows = sqlx::query_as::<_, TurnRow>(&format!(
            r#"
            SELECT * FROM (
                SELECT {} FROM conversations WHERE session_id = $1
                ORDER BY created_at DESC LIMIT $2
            ) recent ORDER BY created_at ASC
            "#,
            TURN_COLUMNS
        ))
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn history(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        limit: usize,
    ) -> FedeResult<Vec<ConversationTurn>> {
        let rows = sqlx::query_as::<_, TurnRow>(&format!(
            r#"
            SELECT * FROM (
                SELECT {} FROM conversations
                WHERE user_id = $1 AND ($2::uuid IS NULL OR session_id = $2)
                ORDER BY created_at DESC LIMIT $3
            ) recent ORDER BY created_at ASC
            "#,
            TURN_COLUMNS
        ))
        .bind(user_id)
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn for_session(&self, session_id: Uuid) -> FedeResult<Vec<ConversationTurn>> {
        let rows = sqlx::query_as::<_, TurnRow>(&format!(
            "SELECT {} FROM conversations WHERE session_id = $1 ORDER BY created_at ASC",
            TURN_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }
}
