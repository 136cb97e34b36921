use serde::Serialize;

use crate::core::errors::{ErrorBody, RagError};
use crate::embedding::ScoredDocument;

/// Elements of a streamed answer, always in the order
/// `sources`, `chunk`*, then exactly one of `done` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Sources {
        request_id: String,
        sources: Vec<ScoredDocument>,
    },
    Chunk {
        content: String,
    },
    Done {
        history_saved: bool,
        citations: Vec<String>,
        degraded: Vec<ErrorBody>,
    },
    Error {
        tag: String,
        message: String,
    },
}

impl StreamEvent {
    pub fn error(err: &RagError) -> Self {
        StreamEvent::Error {
            tag: err.tag().to_string(),
            message: err.to_string(),
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}
