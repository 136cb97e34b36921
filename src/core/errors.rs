use std::fmt;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Upstream dependency a deadline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    HistoryFetch,
    SimilaritySearch,
    Generation,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dependency::HistoryFetch => "history fetch",
            Dependency::SimilaritySearch => "similarity search",
            Dependency::Generation => "generation",
        };
        f.write_str(name)
    }
}

/// Failure taxonomy shared by ingestion, retrieval and generation.
///
/// Every variant maps to a stable tag (see [`RagError::tag`]) that is
/// returned to callers in batch responses and terminal stream events.
#[derive(Debug, Clone, Error)]
pub enum RagError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("record decode error: {0}")]
    RecordDecode(String),
    #[error("document {0} has no embeddable text")]
    EmptyContent(String),
    #[error("{dependency} timed out after {after_ms} ms")]
    DependencyTimeout {
        dependency: Dependency,
        after_ms: u64,
    },
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("history unavailable: {0}")]
    HistoryUnavailable(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl RagError {
    pub fn tag(&self) -> &'static str {
        match self {
            RagError::SourceUnavailable(_) => "SourceUnavailable",
            RagError::RecordDecode(_) => "RecordDecodeError",
            RagError::EmptyContent(_) => "EmptyContentError",
            RagError::DependencyTimeout { .. } => "DependencyTimeout",
            RagError::Generation(_) => "GenerationError",
            RagError::HistoryUnavailable(_) => "HistoryUnavailable",
            RagError::RetrievalUnavailable(_) => "RetrievalUnavailable",
            RagError::InvalidRequest(_) => "InvalidRequest",
            RagError::Configuration(_) => "ConfigurationError",
        }
    }

    pub fn generation<E: fmt::Display>(err: E) -> Self {
        RagError::Generation(err.to_string())
    }

    pub fn history<E: fmt::Display>(err: E) -> Self {
        RagError::HistoryUnavailable(err.to_string())
    }

    pub fn retrieval<E: fmt::Display>(err: E) -> Self {
        RagError::RetrievalUnavailable(err.to_string())
    }

    pub fn source<E: fmt::Display>(err: E) -> Self {
        RagError::SourceUnavailable(err.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RagError::InvalidRequest(_) | RagError::EmptyContent(_) => StatusCode::BAD_REQUEST,
            RagError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RagError::DependencyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RagError::Generation(_) => StatusCode::BAD_GATEWAY,
            RagError::SourceUnavailable(_)
            | RagError::HistoryUnavailable(_)
            | RagError::RetrievalUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::RecordDecode(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Structured `{tag, message}` body used by both delivery modes.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            tag: self.tag().to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub tag: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Rag(#[from] RagError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Rag(err) => {
                let body = Json(json!({ "error": err.to_body() }));
                (err.status_code(), body).into_response()
            }
            ApiError::NotFound(msg) => {
                let body = Json(json!({ "error": { "tag": "NotFound", "message": msg } }));
                (StatusCode::NOT_FOUND, body).into_response()
            }
        }
    }
}
