use thiserror::Error;

use crate::core::errors::RagError;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to load configuration: {0}")]
    Config(#[source] RagError),

    #[error("Failed to initialize history store: {0}")]
    History(#[source] RagError),

    #[error("Failed to initialize embedding index: {0}")]
    Index(#[source] RagError),

    #[error("Failed to initialize LLM provider: {0}")]
    Llm(#[source] RagError),
}
