pub mod cache;
pub mod clock;
pub mod completion;
pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod footer;
pub mod gateway;
pub mod ingest;
pub mod ipc;
pub mod models;
pub mod ranker;
pub mod recorder;
pub mod retry;
pub mod scope;
pub mod session;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{CompletionError, CompletionProvider, OpenAiCompletionClient};
pub use config::{FedeConfig, StorageBackend};
pub use context::{ContextAssembler, ContextPayload, DeclineReason, Verdict};
pub use embeddings::{
    cosine_similarity, EmbeddingBackend, EmbeddingError, OpenAiEmbeddingClient,
    OpenAiEmbeddingConfig,
};
pub use engine::{ChatReply, ChatRequest, EngineParts, FedeEngine, SourceRef};
pub use error::{FedeError, FedeResult};
pub use footer::{FooterSelection, FooterSelector};
pub use gateway::EmbeddingGateway;
pub use ingest::{IngestOutcome, KnowledgeIngestor, ReembedReport};
pub use recorder::ConversationRecorder;
pub use scope::{AcceptAll, KeywordScope, ScopePredicate};
pub use store::{
    ConversationStore, FooterStore, KnowledgeStore, MemoryConversationStore, MemoryFooterStore,
    MemoryKnowledgeStore, PgConversationStore, PgFooterStore, PgKnowledgeStore,
};
