pub mod gateway;
pub mod gemini;
mod http;
pub mod openai_compat;
pub mod provider;
pub mod registry;
pub mod types;

pub use gateway::LlmGateway;
pub use provider::LlmProvider;
pub use registry::{ProviderFactory, ProviderRegistry};
pub use types::{ChatMessage, ChatRequest, ProviderConfig, ProviderInfo, ProviderSpec, TextStream};
