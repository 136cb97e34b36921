use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::errors::RagError;

/// Lazy, finite sequence of generated text chunks.
///
/// Channel closure ends the stream; an `Err` item is always the last one.
/// Dropping the receiver stops the producer and releases the upstream.
pub type TextStream = mpsc::Receiver<Result<String, RagError>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// The `llm` section of the configuration, also the body of a switch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub provider: String,
    pub model_name: Option<String>,
    pub endpoint_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Refuse activation of providers that cannot stream.
    pub require_streaming: bool,
    pub custom_headers: BTreeMap<String, String>,
    /// Dot path into the completion JSON, e.g. `choices.0.message.content`.
    pub response_path: Option<String>,
    pub stream_response_path: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model_name: None,
            endpoint_url: None,
            api_key: None,
            temperature: 0.7,
            max_tokens: 2000,
            timeout_secs: 60,
            require_streaming: false,
            custom_headers: BTreeMap::new(),
            response_path: None,
            stream_response_path: None,
        }
    }
}

impl ProviderConfig {
    pub fn for_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }
}

/// Declared capabilities of a provider kind, checked before activation.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSpec {
    pub name: String,
    pub description: String,
    pub requires_api_key: bool,
    pub requires_endpoint: bool,
    pub default_endpoint: Option<String>,
    pub default_model: Option<String>,
    pub supports_streaming: bool,
}

/// Public description of the active provider. Never carries the key itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub provider: String,
    pub model: String,
    pub endpoint: Option<String>,
    pub has_api_key: bool,
    pub supports_streaming: bool,
}
