//! Context assembler.
//!
//! Drives one request through
//! `Received -> Embedding -> Ranking -> ScopeCheck -> Assembled | Declined | Degraded`
//! and produces a bounded [`ContextPayload`] for the completion step. It never
//! calls the completion provider itself.
//!
//! * The crisis rule is checked on `Received` and wins over everything else.
//! * An embedding failure moves to `Degraded`: history-only context, no
//!   knowledge, no out-of-scope decline.
//! * Trimming to the token budget drops the lowest-ranked knowledge first,
//!   then the oldest history. The current message is never cut.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{ContextConfig, RetrievalConfig};
use crate::error::FedeResult;
use crate::gateway::EmbeddingGateway;
use crate::models::{Category, ContentType, HistoryMessage, KnowledgeSource};
use crate::ranker::{KnowledgeRanker, RankOptions, RankedCandidate};
use crate::scope::{CrisisRule, ScopePredicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Embedding,
    Ranking,
    ScopeCheck,
    Assembled,
    Declined,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    OutOfScope,
    Crisis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Assembled,
    Declined(DeclineReason),
    Degraded,
}

/// A knowledge item as injected into the prompt, with provenance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeExcerpt {
    pub id: Uuid,
    pub title: String,
    pub category: Category,
    pub content_type: ContentType,
    pub excerpt: String,
    pub similarity: f32,
    pub score: f32,
}

impl KnowledgeExcerpt {
    fn from_candidate(candidate: &RankedCandidate, max_chars: usize) -> Self {
        Self {
            id: candidate.item.id,
            title: candidate.item.title.clone(),
            category: candidate.item.category.clone(),
            content_type: candidate.item.content_type,
            excerpt: truncate_chars(&candidate.item.content, max_chars),
            similarity: candidate.similarity,
            score: candidate.score,
        }
    }

    pub fn source(&self) -> KnowledgeSource {
        KnowledgeSource {
            id: self.id,
            title: self.title.clone(),
            category: self.category.clone(),
            content_type: self.content_type,
            score: self.similarity,
        }
    }

    fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.title) + estimate_tokens(&self.excerpt)
    }
}

/// Everything the completion step needs, already within budget.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    pub verdict: Verdict,
    pub message: String,
    /// Highest ranked first.
    pub knowledge: Vec<KnowledgeExcerpt>,
    /// Oldest first.
    pub history: Vec<HistoryMessage>,
    pub estimated_tokens: usize,
    pub dropped_knowledge: usize,
    pub dropped_history: usize,
    pub detected_category: Option<Category>,
    /// Similarity of the best knowledge item used, if any.
    pub confidence: Option<f32>,
    pub degraded_reason: Option<String>,
    pub stages: Vec<Stage>,
}

impl ContextPayload {
    pub fn sources(&self) -> Vec<KnowledgeSource> {
        self.knowledge.iter().map(KnowledgeExcerpt::source).collect()
    }

    pub fn is_declined(&self) -> bool {
        matches!(self.verdict, Verdict::Declined(_))
    }
}

pub struct ContextRequest<'a> {
    pub message: &'a str,
    /// Session history, oldest first.
    pub history: &'a [HistoryMessage],
    pub category_hint: Option<Category>,
}

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Cut to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

pub struct ContextAssembler {
    gateway: Arc<EmbeddingGateway>,
    ranker: KnowledgeRanker,
    scope: Box<dyn ScopePredicate>,
    crisis: Option<CrisisRule>,
    require_scope: bool,
    context: ContextConfig,
    retrieval: RetrievalConfig,
}

struct Trace {
    stages: Vec<Stage>,
}

impl Trace {
    fn new() -> Self {
        tracing::debug!(stage = ?Stage::Received, "Context stage");
        Self {
            stages: vec![Stage::Received],
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!(from = ?self.stages.last(), to = ?stage, "Context stage");
        self.stages.push(stage);
    }
}

impl ContextAssembler {
    pub fn new(
        gateway: Arc<EmbeddingGateway>,
        ranker: KnowledgeRanker,
        scope: Box<dyn ScopePredicate>,
        crisis: Option<CrisisRule>,
        require_scope: bool,
        context: ContextConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            gateway,
            ranker,
            scope,
            crisis,
            require_scope,
            context,
            retrieval,
        }
    }

    pub fn crisis_message(&self) -> Option<&str> {
        self.crisis.as_ref().map(|c| c.message.as_str())
    }

    pub fn scope_name(&self) -> &str {
        self.scope.name()
    }

    /// Build the context for one message. Only storage failures from ranking
    /// are returned as errors.
    pub async fn assemble(&self, request: ContextRequest<'_>) -> FedeResult<ContextPayload> {
        let mut trace = Trace::new();
        let message = request.message.trim().to_string();

        if let Some(rule) = &self.crisis {
            if rule.triggered(&message) {
                tracing::warn!("Crisis rule triggered; escalating");
                trace.enter(Stage::Declined);
                return Ok(self.finish(
                    trace,
                    Verdict::Declined(DeclineReason::Crisis),
                    message,
                    Vec::new(),
                    Vec::new(),
                    request.category_hint,
                    None,
                ));
            }
        }

        trace.enter(Stage::Embedding);
        let query = match self.gateway.embed(&message).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Embedding failed; assembling history-only context");
                trace.enter(Stage::Degraded);
                let history = self.recent_history(request.history);
                return Ok(self.finish(
                    trace,
                    Verdict::Degraded,
                    message,
                    Vec::new(),
                    history,
                    request.category_hint,
                    Some(e.to_string()),
                ));
            }
        };

        trace.enter(Stage::Ranking);
        let options = RankOptions::from_config(&self.retrieval).with_hint(request.category_hint.clone());
        let ranked = self.ranker.rank(&query, &options).await?;

        trace.enter(Stage::ScopeCheck);
        if self.require_scope && ranked.is_empty() && !self.scope.in_expertise(&message) {
            tracing::info!(scope = self.scope.name(), "Declining out-of-scope message");
            trace.enter(Stage::Declined);
            return Ok(self.finish(
                trace,
                Verdict::Declined(DeclineReason::OutOfScope),
                message,
                Vec::new(),
                Vec::new(),
                request.category_hint,
                None,
            ));
        }

        let detected = ranked
            .first()
            .map(|c| c.item.category.clone())
            .or(request.category_hint);
        let knowledge: Vec<KnowledgeExcerpt> = ranked
            .iter()
            .map(|c| KnowledgeExcerpt::from_candidate(c, self.context.excerpt_chars))
            .collect();
        let history = self.recent_history(request.history);

        trace.enter(Stage::Assembled);
        Ok(self.finish(trace, Verdict::Assembled, message, knowledge, history, detected, None))
    }

    fn recent_history(&self, history: &[HistoryMessage]) -> Vec<HistoryMessage> {
        let skip = history.len().saturating_sub(self.context.history_messages);
        history[skip..].to_vec()
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        trace: Trace,
        verdict: Verdict,
        message: String,
        mut knowledge: Vec<KnowledgeExcerpt>,
        mut history: Vec<HistoryMessage>,
        detected_category: Option<Category>,
        degraded_reason: Option<String>,
    ) -> ContextPayload {
        let budget = self.context.token_budget;
        let message_tokens = estimate_tokens(&message);
        let knowledge_tokens: usize = knowledge.iter().map(KnowledgeExcerpt::estimated_tokens).sum();
        let history_tokens: usize = history.iter().map(|h| estimate_tokens(&h.content)).sum();
        let mut total = message_tokens + knowledge_tokens + history_tokens;

        let mut dropped_knowledge = 0;
        while total > budget {
            match knowledge.pop() {
                Some(k) => {
                    total -= k.estimated_tokens();
                    dropped_knowledge += 1;
                }
                None => break,
            }
        }

        let mut dropped_history = 0;
        while total > budget && !history.is_empty() {
            let oldest = history.remove(0);
            total -= estimate_tokens(&oldest.content);
            dropped_history += 1;
        }

        if dropped_knowledge > 0 || dropped_history > 0 {
            tracing::debug!(
                budget = budget,
                tokens = total,
                dropped_knowledge = dropped_knowledge,
                dropped_history = dropped_history,
                "Trimmed context to budget"
            );
        }

        let confidence = knowledge.first().map(|k| k.similarity);

        ContextPayload {
            verdict,
            message,
            knowledge,
            history,
            estimated_tokens: total,
            dropped_knowledge,
            dropped_history,
            detected_category,
            confidence,
            degraded_reason,
            stages: trace.stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::config::ScopeConfig;
    use crate::embeddings::{EmbeddingBackend, EmbeddingError};
    use crate::models::{KnowledgeItem, NewKnowledge};
    use crate::retry::RetryPolicy;
    use crate::scope::{predicate_from_config, KeywordScope};
    use crate::store::{KnowledgeStore, MemoryKnowledgeStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    /// Maps every text to the same direction, or fails on demand.
    struct FixedBackend {
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingBackend for FixedBackend {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if self.fail {
                Err(EmbeddingError::Api {
                    code: 500,
                    message: "boom".to_string(),
                })
            } else {
                Ok(vec![1.0, 0.0])
            }
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn gateway(fail: bool) -> Arc<EmbeddingGateway> {
        Arc::new(EmbeddingGateway::with_policy(
            Arc::new(FixedBackend { fail }),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1), Duration::from_secs(1)),
            EmbeddingCache::new(Duration::from_secs(60), 16),
        ))
    }

    fn item(title: &str, content: &str, priority: i32) -> KnowledgeItem {
        KnowledgeItem::from_new(
            NewKnowledge {
                title: title.to_string(),
                content: content.to_string(),
                content_type: Default::default(),
                category: Category::RupturaPareja,
                tags: vec![],
                priority: Some(priority),
                source_url: None,
                metadata: None,
            },
            Utc::now(),
        )
    }

    fn assembler(store: Arc<MemoryKnowledgeStore>, fail: bool, context: ContextConfig) -> ContextAssembler {
        let retrieval = RetrievalConfig::default();
        let scope = ScopeConfig::default();
        ContextAssembler::new(
            gateway(fail),
            KnowledgeRanker::new(store, &retrieval),
            predicate_from_config(&scope).unwrap(),
            CrisisRule::from_config(&scope).unwrap(),
            true,
            context,
            retrieval,
        )
    }

    fn history(n: usize) -> Vec<HistoryMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    HistoryMessage::user(format!("mensaje {}", i), Utc::now())
                } else {
                    HistoryMessage::assistant(format!("respuesta {}", i), Utc::now())
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_store_and_off_topic_message_is_out_of_scope() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let a = assembler(store, false, ContextConfig::default());

        let payload = a
            .assemble(ContextRequest {
                message: "¿Cuál es la capital de Francia?",
                history: &[],
                category_hint: None,
            })
            .await
            .unwrap();

        assert_eq!(payload.verdict, Verdict::Declined(DeclineReason::OutOfScope));
        assert!(payload.knowledge.is_empty());
        assert_eq!(
            payload.stages,
            vec![Stage::Received, Stage::Embedding, Stage::Ranking, Stage::ScopeCheck, Stage::Declined]
        );
    }

    #[tokio::test]
    async fn empty_store_but_expertise_message_is_assembled() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let a = assembler(store, false, ContextConfig::default());

        let payload = a
            .assemble(ContextRequest {
                message: "Mi pareja me dejó y no sé qué hacer",
                history: &[],
                category_hint: None,
            })
            .await
            .unwrap();
        assert_eq!(payload.verdict, Verdict::Assembled);
        assert!(payload.knowledge.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_history_only() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        store
            .upsert(&item("Contacto cero", "No le escribas", 5), Some(&[1.0, 0.0][..]))
            .await
            .unwrap();
        let a = assembler(store, true, ContextConfig::default());
        let past = history(10);

        let payload = a
            .assemble(ContextRequest {
                message: "¿Qué hago con la capital de Francia?",
                history: &past,
                category_hint: None,
            })
            .await
            .unwrap();

        assert_eq!(payload.verdict, Verdict::Degraded);
        assert!(payload.knowledge.is_empty());
        assert_eq!(payload.history.len(), ContextConfig::default().history_messages);
        assert_eq!(payload.history.last().map(|h| h.content.as_str()), Some("respuesta 9"));
        assert!(payload.degraded_reason.is_some());
        assert_eq!(payload.stages.last(), Some(&Stage::Degraded));
    }

    #[tokio::test]
    async fn crisis_rule_wins_over_ranking() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        store
            .upsert(&item("Ruptura", "Contenido", 5), Some(&[1.0, 0.0][..]))
            .await
            .unwrap();
        let a = assembler(store, false, ContextConfig::default());

        let payload = a
            .assemble(ContextRequest {
                message: "Después de la ruptura pienso en el suicidio",
                history: &[],
                category_hint: None,
            })
            .await
            .unwrap();

        assert_eq!(payload.verdict, Verdict::Declined(DeclineReason::Crisis));
        assert_eq!(payload.stages, vec![Stage::Received, Stage::Declined]);
    }

    #[tokio::test]
    async fn trimming_drops_lowest_knowledge_then_oldest_history() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let body = "x".repeat(400);
        let best = item("best", &body, 9);
        let worst = item("worst", &body, 1);
        store.upsert(&best, Some(&[1.0, 0.0][..])).await.unwrap();
        // Slightly off-axis so it ranks second.
        store.upsert(&worst, Some(&[0.98, 0.2][..])).await.unwrap();

        // Excerpts are 300 chars -> 75 tokens + 2 for the title each.
        let context = ContextConfig {
            token_budget: 100,
            ..ContextConfig::default()
        };
        let a = assembler(store, false, context);
        let past = history(4);
        let message = "¿Cómo supero la ruptura con mi ex?";

        let payload = a
            .assemble(ContextRequest {
                message,
                history: &past,
                category_hint: None,
            })
            .await
            .unwrap();

        assert_eq!(payload.verdict, Verdict::Assembled);
        assert_eq!(payload.message, message);
        assert_eq!(payload.knowledge.len(), 1);
        assert_eq!(payload.knowledge[0].id, best.id);
        assert_eq!(payload.dropped_knowledge, 1);
        assert!(payload.estimated_tokens <= 100);
        // History survived untouched once the knowledge fit.
        assert_eq!(payload.history.len(), 4);
        assert_eq!(payload.confidence, Some(payload.knowledge[0].similarity));
    }

    #[tokio::test]
    async fn message_is_never_truncated_even_over_budget() {
        let store = Arc::new(MemoryKnowledgeStore::new());
        store
            .upsert(&item("Ruptura", "Contenido útil", 5), Some(&[1.0, 0.0][..]))
            .await
            .unwrap();
        let context = ContextConfig {
            token_budget: 5,
            ..ContextConfig::default()
        };
        let a = assembler(store, false, context);
        let message = "ruptura ".repeat(20);
        let past = history(3);

        let payload = a
            .assemble(ContextRequest {
                message: &message,
                history: &past,
                category_hint: None,
            })
            .await
            .unwrap();

        assert_eq!(payload.message, message.trim());
        assert!(payload.knowledge.is_empty());
        assert!(payload.history.is_empty());
        assert_eq!(payload.dropped_history, 3);
    }

    #[test]
    fn custom_scope_predicate_is_pluggable() {
        struct Nothing;
        impl ScopePredicate for Nothing {
            fn in_expertise(&self, _m: &str) -> bool {
                false
            }
            fn name(&self) -> &str {
                "nothing"
            }
        }
        let store = Arc::new(MemoryKnowledgeStore::new());
        let retrieval = RetrievalConfig::default();
        let a = ContextAssembler::new(
            gateway(false),
            KnowledgeRanker::new(store, &retrieval),
            Box::new(Nothing),
            None,
            true,
            ContextConfig::default(),
            retrieval,
        );
        assert_eq!(a.scope_name(), "nothing");
        assert!(a.crisis_message().is_none());
        assert!(KeywordScope::new(&["x".to_string()]).is_ok());
    }

    #[test]
    fn token_estimate_and_truncation() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(truncate_chars("corazón", 10), "corazón");
        assert_eq!(truncate_chars("corazón roto", 7), "corazón...");
    }
}
