use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::http::{ensure_success, spawn_sse_pump, transport_error};
use super::provider::LlmProvider;
use super::types::{ChatRequest, ProviderConfig, ProviderInfo, TextStream};
use crate::core::errors::RagError;

pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Google Generative Language REST API.
#[derive(Clone)]
pub struct GeminiProvider {
    base_url: String,
    model: String,
    api_key: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
    client: Client,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, RagError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| RagError::Configuration("gemini requires an api_key".to_string()))?;

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RagError::Configuration(format!("http client: {}", e)))?;

        Ok(Self {
            base_url: config
                .endpoint_url
                .as_deref()
                .unwrap_or(DEFAULT_GEMINI_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            model: config
                .model_name
                .clone()
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
            client,
        })
    }

    /// System messages become `systemInstruction`; the rest map to turns.
    fn body(&self, request: &ChatRequest) -> Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                let role = if m.role == "assistant" { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature.unwrap_or(self.temperature),
                "maxOutputTokens": request.max_tokens.unwrap_or(self.max_tokens),
            }
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        body
    }

    async fn post(&self, url: String, body: &Value, stream: bool) -> Result<reqwest::Response, RagError> {
        let mut builder = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body);
        if !stream {
            builder = builder.timeout(self.timeout);
        }
        let res = builder
            .send()
            .await
            .map_err(|e| transport_error("gemini", e))?;
        ensure_success("gemini", res).await
    }
}

/// Concatenates the text parts of the first candidate.
fn candidate_text(payload: &Value) -> Option<String> {
    let parts = payload["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part["text"].as_str())
        .collect();
    Some(text)
}

fn block_reason(payload: &Value) -> Option<&str> {
    payload["promptFeedback"]["blockReason"].as_str()
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            provider: "gemini".to_string(),
            model: self.model.clone(),
            endpoint: Some(self.base_url.clone()),
            has_api_key: true,
            supports_streaming: true,
        }
    }

    async fn generate(&self, request: ChatRequest) -> Result<String, RagError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let res = self.post(url, &self.body(&request), false).await?;
        let payload: Value = res
            .json()
            .await
            .map_err(|e| RagError::Generation(format!("gemini returned malformed JSON: {}", e)))?;

        if let Some(reason) = block_reason(&payload) {
            return Err(RagError::Generation(format!("gemini blocked the prompt: {}", reason)));
        }
        candidate_text(&payload)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| RagError::Generation("gemini response has no candidates".to_string()))
    }

    async fn generate_stream(&self, request: ChatRequest) -> Result<TextStream, RagError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let res = self.post(url, &self.body(&request), true).await?;
        Ok(spawn_sse_pump("gemini".to_string(), res, candidate_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    fn provider() -> GeminiProvider {
        let mut config = ProviderConfig::for_provider("gemini");
        config.api_key = Some("key".to_string());
        GeminiProvider::new(&config).unwrap()
    }

    #[test]
    fn requires_api_key() {
        let config = ProviderConfig::for_provider("gemini");
        assert!(GeminiProvider::new(&config).is_err());
    }

    #[test]
    fn body_moves_system_prompt_to_instruction() {
        let request = ChatRequest::new(vec![
            ChatMessage::system("be precise"),
            ChatMessage::user("what is q3 revenue?"),
        ]);
        let body = provider().body(&request);

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be precise");
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2000);
    }

    #[test]
    fn candidate_text_joins_parts() {
        let payload = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Q3 " }, { "text": "was 1.2M" }] } }]
        });
        assert_eq!(candidate_text(&payload).as_deref(), Some("Q3 was 1.2M"));
        assert_eq!(candidate_text(&json!({})), None);
    }
}
