//! Retrieval-augmented answering.

pub mod events;
pub mod orchestrator;

pub use events::StreamEvent;
pub use orchestrator::{AnswerRequest, AnswerResponse, RagOrchestrator, RequestPhase};
