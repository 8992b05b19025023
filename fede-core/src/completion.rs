//! Completion provider: the external text-generation step.
//!
//! The engine treats it as opaque: it hands over the persona plus an assembled
//! [`ContextPayload`] and gets text back. [`OpenAiCompletionClient`] speaks the
//! OpenAI-compatible `/chat/completions` API. Completion calls are not retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CompletionConfig;
use crate::context::ContextPayload;
use crate::embeddings::OpenAiErrorResponse;
use crate::models::Role;

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Completion returned no content")]
    EmptyResponse,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Completion timed out after {0} ms")]
    Timeout(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError>;

    fn name(&self) -> &str;
}

/// System prompt: persona, then either the knowledge block or a note to rely
/// on general experience.
pub fn system_prompt(persona: &str, payload: &ContextPayload) -> String {
    let mut prompt = String::from(persona);
    prompt.push_str("\n\n");

    if payload.knowledge.is_empty() {
        prompt.push_str(
            "Basate en tu experiencia como coach ontológico especializado en rupturas de pareja.",
        );
        return prompt;
    }

    prompt.push_str("CONTEXTO RELEVANTE DE TU CONOCIMIENTO:\n\n");
    for (i, k) in payload.knowledge.iter().enumerate() {
        prompt.push_str(&format!("{}. {} ({}):\n{}\n\n", i + 1, k.title, k.content_type, k.excerpt));
    }
    prompt.push_str(
        "Usá esta información para enriquecer tu respuesta, pero mantené tu estilo personal \
         y agregá tu experiencia.",
    );
    prompt
}

/// Full message list: system prompt, trimmed history, current message.
pub fn build_messages(persona: &str, payload: &ContextPayload) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(payload.history.len() + 2);
    messages.push(ChatMessage::new(Role::System, system_prompt(persona, payload)));
    for h in &payload.history {
        messages.push(ChatMessage::new(h.role, h.content.clone()));
    }
    messages.push(ChatMessage::new(Role::User, payload.message.clone()));
    messages
}

// ============================================================================
// OpenAI client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiCompletionClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl OpenAiCompletionClient {
    pub fn new(api_key: Option<String>, config: &CompletionConfig) -> Result<Self, CompletionError> {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            return Err(CompletionError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(config.timeout() + Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletionClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            max_completion_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OpenAiErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(body);
            tracing::error!(code = status.as_u16(), message = %message, "Completion API error");
            return Err(CompletionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(CompletionError::EmptyResponse)
    }

    fn name(&self) -> &str {
        "openai"
    }
}
