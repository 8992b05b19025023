//! Process state shared by the HTTP and IPC transports.

use std::sync::Arc;

use fede_core::config::StorageBackend;
use fede_core::store::{ConversationStore, FooterStore, KnowledgeStore};
use fede_core::{
    db, EngineParts, FedeConfig, FedeEngine, MemoryConversationStore, MemoryFooterStore,
    MemoryKnowledgeStore, OpenAiCompletionClient, OpenAiEmbeddingClient, OpenAiEmbeddingConfig,
    PgConversationStore, PgFooterStore, PgKnowledgeStore, SystemClock,
};
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub engine: FedeEngine,
    /// Present with the Postgres backend; used for health reporting.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(engine: FedeEngine, pool: Option<PgPool>) -> Self {
        Self { engine, pool }
    }

    pub fn config(&self) -> &FedeConfig {
        self.engine.config()
    }

    /// Build stores and providers from configuration.
    ///
    /// The Postgres backend connects and, unless disabled, runs migrations.
    /// Both providers read their key from `OPENAI_API_KEY`.
    pub async fn from_config(config: FedeConfig) -> anyhow::Result<Self> {
        let (knowledge, footers, conversations, pool): (
            Arc<dyn KnowledgeStore>,
            Arc<dyn FooterStore>,
            Arc<dyn ConversationStore>,
            Option<PgPool>,
        ) = match config.database.backend {
            StorageBackend::Postgres => {
                let pool = db::create_pool(&config.database).await?;
                if config.database.run_migrations {
                    db::run_migrations(&pool).await?;
                    tracing::info!("Database migrations applied");
                }
                (
                    Arc::new(PgKnowledgeStore::new(pool.clone())),
                    Arc::new(PgFooterStore::new(pool.clone())),
                    Arc::new(PgConversationStore::new(pool.clone())),
                    Some(pool),
                )
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory stores; data is lost on restart");
                (
                    Arc::new(MemoryKnowledgeStore::new()),
                    Arc::new(MemoryFooterStore::new()),
                    Arc::new(MemoryConversationStore::new()),
                    None,
                )
            }
        };

        let embedder = OpenAiEmbeddingClient::new(OpenAiEmbeddingConfig::from_config(None, &config.embedding))?;
        let completion = OpenAiCompletionClient::new(None, &config.completion)?;

        let engine = FedeEngine::new(
            config,
            EngineParts {
                knowledge,
                footers,
                conversations,
                embedder: Arc::new(embedder),
                completion: Arc::new(completion),
                clock: Arc::new(SystemClock),
                rng_seed: None,
                scope: None,
            },
        )?;

        Ok(Self::new(engine, pool))
    }
}
