//! `FedeEngine`: the process-wide service object.
//!
//! Built once from a validated [`FedeConfig`] and injected dependencies
//! (stores, embedding backend, completion provider, clock, RNG seed). Cheap to
//! clone; every clone shares the same state.
//!
//! Chat flow: validate -> lock session -> assemble context -> completion ->
//! update session -> reply -> record. Everything from the completion call
//! onwards runs in a spawned task that owns the session guard, so a caller
//! that goes away mid-request cannot leave a half-recorded turn behind: the
//! task finishes and its result is discarded. The turn is written after the
//! reply has been handed back and the session released; the caller never
//! waits on the conversation store.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::clock::Clock;
use crate::completion::{build_messages, CompletionError, CompletionProvider};
use crate::config::FedeConfig;
use crate::context::{ContextAssembler, ContextPayload, ContextRequest, DeclineReason, Verdict};
use crate::embeddings::EmbeddingBackend;
use crate::error::{FedeError, FedeResult};
use crate::footer::FooterSelector;
use crate::gateway::EmbeddingGateway;
use crate::ingest::KnowledgeIngestor;
use crate::models::{Category, ConversationTurn, ContentType, TurnOutcome};
use crate::ranker::KnowledgeRanker;
use crate::recorder::ConversationRecorder;
use crate::scope::{predicate_from_config, CrisisRule, ScopePredicate};
use crate::session::SessionRegistry;
use crate::store::{ConversationStore, FooterStore, KnowledgeStore};

/// Injected collaborators.
pub struct EngineParts {
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub footers: Arc<dyn FooterStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub embedder: Arc<dyn EmbeddingBackend>,
    pub completion: Arc<dyn CompletionProvider>,
    pub clock: Arc<dyn Clock>,
    /// Fixed seed for footer draws and reply picks; OS entropy when `None`.
    pub rng_seed: Option<u64>,
    /// Overrides the keyword predicate built from `[scope]`.
    pub scope: Option<Box<dyn ScopePredicate>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub message: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub title: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub success: bool,
    pub message: String,
    pub session_id: Uuid,
    pub conversation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_out_of_scope: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
    /// Milliseconds.
    pub processing_time: i64,
}

struct EngineInner {
    config: FedeConfig,
    gateway: Arc<EmbeddingGateway>,
    assembler: ContextAssembler,
    sessions: SessionRegistry,
    footers: FooterSelector,
    recorder: ConversationRecorder,
    ingestor: KnowledgeIngestor,
    knowledge: Arc<dyn KnowledgeStore>,
    completion: Arc<dyn CompletionProvider>,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

#[derive(Clone)]
pub struct FedeEngine {
    inner: Arc<EngineInner>,
}

impl FedeEngine {
    pub fn new(config: FedeConfig, parts: EngineParts) -> FedeResult<Self> {
        config.validate()?;

        let gateway = Arc::new(EmbeddingGateway::new(parts.embedder, &config.embedding));
        let ranker = KnowledgeRanker::new(parts.knowledge.clone(), &config.retrieval);
        let scope = match parts.scope {
            Some(s) => s,
            None => predicate_from_config(&config.scope)?,
        };
        let crisis = CrisisRule::from_config(&config.scope)?;
        let assembler = ContextAssembler::new(
            gateway.clone(),
            ranker,
            scope,
            crisis,
            config.scope.require_scope,
            config.context.clone(),
            config.retrieval.clone(),
        );

        let (footer_rng, reply_rng) = match parts.rng_seed {
            Some(seed) => (StdRng::seed_from_u64(seed), StdRng::seed_from_u64(seed.wrapping_add(1))),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };

        let inner = EngineInner {
            sessions: SessionRegistry::new(parts.conversations.clone(), parts.clock.clone(), &config.session),
            footers: FooterSelector::new(parts.footers, parts.clock.clone(), &config.footer, footer_rng),
            recorder: ConversationRecorder::new(parts.conversations),
            ingestor: KnowledgeIngestor::new(parts.knowledge.clone(), gateway.clone(), parts.clock.clone()),
            knowledge: parts.knowledge,
            completion: parts.completion,
            clock: parts.clock,
            rng: Mutex::new(reply_rng),
            gateway,
            assembler,
            config,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &FedeConfig {
        &self.inner.config
    }

    pub fn footers(&self) -> &FooterSelector {
        &self.inner.footers
    }

    pub fn recorder(&self) -> &ConversationRecorder {
        &self.inner.recorder
    }

    pub fn knowledge(&self) -> &KnowledgeIngestor {
        &self.inner.ingestor
    }

    /// Drop idle, unlocked sessions. Returns how many were evicted.
    pub fn evict_idle_sessions(&self) -> usize {
        self.inner.sessions.evict_idle()
    }

    pub fn new_session(&self) -> Uuid {
        Uuid::new_v4()
    }

    /// Engine-level health: store backend, active knowledge, live sessions.
    pub async fn health(&self) -> FedeResult<serde_json::Value> {
        let active = self.inner.knowledge.count_active().await?;
        Ok(serde_json::json!({
            "store": self.inner.knowledge.backend_name(),
            "activeKnowledge": active,
            "liveSessions": self.inner.sessions.len(),
            "embeddingBackend": self.inner.gateway.backend_name(),
            "embeddingCacheEntries": self.inner.gateway.cache_len(),
            "completionProvider": self.inner.completion.name(),
            "scope": self.inner.assembler.scope_name(),
        }))
    }

    fn validate_message(&self, message: &str) -> FedeResult<String> {
        let message = message.trim();
        if message.is_empty() {
            return Err(FedeError::invalid("message cannot be empty"));
        }
        let max = self.inner.config.context.max_message_chars;
        if message.chars().count() > max {
            return Err(FedeError::invalid(format!("message exceeds {} characters", max)));
        }
        Ok(message.to_string())
    }

    /// Handle one chat message. Only validation, session ownership and
    /// storage failures come back as errors; every other path yields a reply.
    pub async fn chat(&self, request: ChatRequest) -> FedeResult<ChatReply> {
        let started = Instant::now();
        let message = self.validate_message(&request.message)?;
        let category_hint = match request.category.as_deref().map(str::trim) {
            Some(c) if !c.is_empty() => Some(c.parse::<Category>().map_err(FedeError::InvalidInput)?),
            _ => None,
        };
        let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);

        let session = self.inner.sessions.acquire(session_id, request.user_id).await?;
        let history = session.history();

        let payload = self
            .inner
            .assembler
            .assemble(ContextRequest {
                message: &message,
                history: &history,
                category_hint,
            })
            .await?;

        let inner = self.inner.clone();
        let user_id = request.user_id;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut session = session;
            match inner.respond(user_id, session_id, payload, started).await {
                Ok((turn, reply)) => {
                    session.push_exchange(&turn.user_message, &turn.assistant_response, turn.created_at);
                    drop(session);
                    let _ = tx.send(Ok(reply));
                    inner.recorder.record(&turn).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        });

        rx.await
            .map_err(|_| FedeError::Internal("chat task ended without a reply".to_string()))?
    }
}

impl EngineInner {
    fn pick_out_of_scope_reply(&self) -> String {
        let replies = &self.config.scope.out_of_scope_responses;
        if replies.is_empty() {
            return self.config.completion.fallback_message.clone();
        }
        let idx = self.rng.lock().gen_range(0..replies.len());
        replies[idx].clone()
    }

    async fn complete(&self, payload: &ContextPayload) -> Result<String, CompletionError> {
        let messages = build_messages(&self.config.completion.persona, payload);
        let timeout = self.config.completion.timeout();
        match tokio::time::timeout(timeout, self.completion.complete(&messages)).await {
            Ok(result) => result,
            Err(_) => Err(CompletionError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn respond(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        payload: ContextPayload,
        started: Instant,
    ) -> FedeResult<(ConversationTurn, ChatReply)> {
        let mut reply_flags = (None, None, None);
        let mut use_sources = false;

        let (response, outcome, was_successful, success) = match payload.verdict {
            Verdict::Declined(DeclineReason::Crisis) => {
                reply_flags.1 = Some(true);
                let text = self
                    .assembler
                    .crisis_message()
                    .unwrap_or(self.config.scope.crisis_message.as_str())
                    .to_string();
                (text, TurnOutcome::CrisisEscalation, true, true)
            }
            Verdict::Declined(DeclineReason::OutOfScope) => {
                reply_flags.0 = Some(true);
                (self.pick_out_of_scope_reply(), TurnOutcome::OutOfScope, true, true)
            }
            Verdict::Assembled | Verdict::Degraded => {
                let degraded = payload.verdict == Verdict::Degraded;
                if degraded {
                    reply_flags.2 = Some(true);
                }
                match self.complete(&payload).await {
                    Ok(text) => {
                        use_sources = !degraded;
                        let outcome = if degraded {
                            TurnOutcome::Degraded
                        } else {
                            TurnOutcome::Answered
                        };
                        (text, outcome, !degraded, true)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Completion failed; replying with fallback");
                        (
                            self.config.completion.fallback_message.clone(),
                            TurnOutcome::Failed,
                            false,
                            false,
                        )
                    }
                }
            }
        };

        let now = self.clock.now();
        let sources = if use_sources { payload.sources() } else { Vec::new() };

        if !sources.is_empty() {
            let ids: Vec<Uuid> = sources.iter().map(|s| s.id).collect();
            if let Err(e) = self.knowledge.increment_usage(&ids, now).await {
                tracing::warn!(error = %e, "Failed to update knowledge usage");
            }
        }

        let processing_time = started.elapsed().as_millis() as i64;
        let turn = ConversationTurn {
            id: Uuid::new_v4(),
            session_id,
            user_id,
            user_message: payload.message.clone(),
            assistant_response: response.clone(),
            knowledge_sources: sources.clone(),
            detected_category: payload.detected_category.clone(),
            outcome,
            confidence: if use_sources { payload.confidence } else { None },
            was_successful,
            user_rating: None,
            user_feedback: None,
            processing_time_ms: processing_time,
            created_at: now,
        };

        let source_refs = if use_sources {
            Some(
                sources
                    .iter()
                    .map(|s| SourceRef {
                        title: s.title.clone(),
                        content_type: s.content_type,
                        category: s.category.clone(),
                    })
                    .collect(),
            )
        } else {
            None
        };

        let reply = ChatReply {
            success,
            message: response,
            session_id,
            conversation_id: turn.id,
            is_out_of_scope: reply_flags.0,
            escalation: reply_flags.1,
            degraded: reply_flags.2,
            sources: source_refs,
            processing_time,
        };

        Ok((turn, reply))
    }
}
