use async_trait::async_trait;

use super::types::{ChatRequest, ProviderInfo, TextStream};
use crate::core::errors::RagError;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// provider name (e.g. "ollama", "gemini", "custom")
    fn name(&self) -> &str;

    fn info(&self) -> ProviderInfo;

    /// full completion; no retry here
    async fn generate(&self, request: ChatRequest) -> Result<String, RagError>;

    /// streaming completion; errors after the stream opened arrive as the last item
    async fn generate_stream(&self, request: ChatRequest) -> Result<TextStream, RagError>;
}
