//! Shared fixtures: in-memory engine with deterministic providers.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use fede_core::completion::ChatMessage;
use fede_core::{
    CompletionError, CompletionProvider, EmbeddingBackend, EmbeddingError, EngineParts, FedeConfig,
    FedeEngine, MemoryConversationStore, MemoryFooterStore, MemoryKnowledgeStore, SystemClock,
};
use fede_server::AppState;

pub const TOPICS: [&str; 4] = ["contacto", "autoestima", "redes", "ex"];

/// One dimension per topic word plus a constant, so related texts land close.
pub struct TopicEmbedder {
    pub dimensions: usize,
}

#[async_trait]
impl EmbeddingBackend for TopicEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lower = text.to_lowercase();
        let mut v = vec![0.0; self.dimensions];
        for (i, topic) in TOPICS.iter().enumerate() {
            if lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == *topic) {
                v[i] = 1.0;
            }
        }
        v[self.dimensions - 1] = 0.05;
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "topic"
    }
}

/// Echoes the last user message.
pub struct EchoCompletion;

#[async_trait]
impl CompletionProvider for EchoCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("Fede dice: {}", last))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

pub fn memory_config(dimensions: usize) -> FedeConfig {
    let mut config = FedeConfig::in_memory();
    config.embedding.dimensions = dimensions;
    config.embedding.max_retries = 0;
    config
}

pub fn memory_state() -> AppState {
    let dimensions = 8;
    let engine = FedeEngine::new(
        memory_config(dimensions),
        EngineParts {
            knowledge: Arc::new(MemoryKnowledgeStore::new()),
            footers: Arc::new(MemoryFooterStore::new()),
            conversations: Arc::new(MemoryConversationStore::new()),
            embedder: Arc::new(TopicEmbedder { dimensions }),
            completion: Arc::new(EchoCompletion),
            clock: Arc::new(SystemClock),
            rng_seed: Some(7),
            scope: None,
        },
    )
    .unwrap();
    AppState::new(engine, None)
}
