use thiserror::Error;

use crate::completion::CompletionError;
use crate::embeddings::EmbeddingError;

#[derive(Error, Debug)]
pub enum FedeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbeddingError),

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FedeError {
    /// Stable machine-readable code, carried over the IPC and HTTP surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            FedeError::Database(_) | FedeError::Migrate(_) | FedeError::Storage(_) => "storage",
            FedeError::Config(_) => "config",
            FedeError::EmbeddingUnavailable(_) => "embedding_unavailable",
            FedeError::Completion(_) => "completion",
            FedeError::InvalidInput(_) => "invalid_input",
            FedeError::NotFound(_) => "not_found",
            FedeError::Io(_) | FedeError::Ipc(_) | FedeError::Internal(_) => "internal",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        FedeError::InvalidInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        FedeError::NotFound(what.into())
    }
}

pub type FedeResult<T> = Result<T, FedeError>;
