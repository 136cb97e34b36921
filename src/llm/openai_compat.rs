use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::http::{ensure_success, extract_path, spawn_sse_pump, split_path, transport_error};
use super::provider::LlmProvider;
use super::types::{ChatRequest, ProviderConfig, ProviderInfo, TextStream};
use crate::core::errors::RagError;

pub const DEFAULT_RESPONSE_PATH: &str = "choices.0.message.content";
pub const DEFAULT_STREAM_RESPONSE_PATH: &str = "choices.0.delta.content";

/// Any backend speaking the OpenAI chat-completions wire format: Ollama,
/// LM Studio, hosted OpenAI-compatible APIs and custom servers whose reply
/// shape is described by dot paths.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    name: String,
    url: String,
    model: String,
    api_key: Option<String>,
    headers: BTreeMap<String, String>,
    response_path: Vec<String>,
    stream_response_path: Vec<String>,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
    client: Client,
}

impl OpenAiCompatProvider {
    /// `url` is the full chat-completions endpoint.
    pub fn new(
        name: &str,
        url: String,
        model: String,
        config: &ProviderConfig,
    ) -> Result<Self, RagError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RagError::Configuration(format!("http client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            model,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            headers: config.custom_headers.clone(),
            response_path: split_path(
                config
                    .response_path
                    .as_deref()
                    .unwrap_or(DEFAULT_RESPONSE_PATH),
            ),
            stream_response_path: split_path(
                config
                    .stream_response_path
                    .as_deref()
                    .unwrap_or(DEFAULT_STREAM_RESPONSE_PATH),
            ),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
            client,
        })
    }

    /// Local servers are configured with a base URL; the chat route is appended.
    pub fn chat_url(base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": request.messages,
            "stream": stream,
            "temperature": request.temperature.unwrap_or(self.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        })
    }

    /// Streaming requests are bounded by the caller's idle timeout instead of
    /// a total deadline, so long answers are not cut off.
    async fn post(&self, body: &Value, stream: bool) -> Result<reqwest::Response, RagError> {
        let mut builder = self.client.post(&self.url).json(body);
        if !stream {
            builder = builder.timeout(self.timeout);
        }
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let res = builder
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        ensure_success(&self.name, res).await
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: self.name.clone(),
            model: self.model.clone(),
            endpoint: Some(self.url.clone()),
            has_api_key: self.api_key.is_some(),
            supports_streaming: true,
        }
    }

    async fn generate(&self, request: ChatRequest) -> Result<String, RagError> {
        let res = self.post(&self.body(&request, false), false).await?;
        let payload: Value = res.json().await.map_err(|e| {
            RagError::Generation(format!("{} returned malformed JSON: {}", self.name, e))
        })?;

        match extract_path(&payload, &self.response_path).and_then(Value::as_str) {
            Some(content) => Ok(content.to_string()),
            None => Err(RagError::Generation(format!(
                "{} response has no text at '{}'",
                self.name,
                self.response_path.join(".")
            ))),
        }
    }

    async fn generate_stream(&self, request: ChatRequest) -> Result<TextStream, RagError> {
        let res = self.post(&self.body(&request, true), true).await?;
        let path = self.stream_response_path.clone();

        Ok(spawn_sse_pump(self.name.clone(), res, move |json| {
            extract_path(json, &path)
                .and_then(Value::as_str)
                .map(str::to_string)
        }))
    }
}
