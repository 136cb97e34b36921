use std::collections::BTreeMap;
use std::sync::Arc;

use super::gemini::{GeminiProvider, DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL};
use super::openai_compat::OpenAiCompatProvider;
use super::provider::LlmProvider;
use super::types::{ProviderConfig, ProviderSpec};
use crate::core::errors::RagError;

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderConfig, &ProviderSpec) -> Result<Arc<dyn LlmProvider>, RagError> + Send + Sync>;

struct Entry {
    spec: ProviderSpec,
    factory: ProviderFactory,
}

/// Provider name → declared capabilities + constructor.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in catalog.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();

        registry.register(
            spec("gemini", "Google Gemini via the Generative Language API")
                .api_key()
                .endpoint_default(DEFAULT_GEMINI_ENDPOINT)
                .model_default(DEFAULT_GEMINI_MODEL),
            Arc::new(gemini),
        );
        registry.register(
            spec("ollama", "Local Ollama server (OpenAI-compatible API)")
                .endpoint_default("http://localhost:11434")
                .model_default("llama2"),
            Arc::new(local_server),
        );
        registry.register(
            spec("lmstudio", "Local LM Studio server")
                .endpoint_default("http://localhost:1234")
                .model_default("local-model"),
            Arc::new(local_server),
        );
        registry.register(
            spec("openai-compatible", "Hosted OpenAI-compatible chat completions API")
                .api_key()
                .endpoint(),
            Arc::new(full_endpoint),
        );
        registry.register(
            spec("custom", "Custom HTTP endpoint with configurable response paths")
                .endpoint()
                .model_default("default"),
            Arc::new(full_endpoint),
        );

        registry
    }

    pub fn register(&mut self, spec: ProviderSpec, factory: ProviderFactory) {
        self.entries
            .insert(spec.name.clone(), Entry { spec, factory });
    }

    pub fn specs(&self) -> Vec<ProviderSpec> {
        self.entries.values().map(|e| e.spec.clone()).collect()
    }

    /// Checks `config` against the declared capabilities without building.
    pub fn validate(&self, config: &ProviderConfig) -> Result<&ProviderSpec, RagError> {
        let name = normalize(&config.provider);
        let entry = self.entries.get(&name).ok_or_else(|| {
            RagError::InvalidRequest(format!(
                "unsupported provider '{}'; supported: {}",
                config.provider,
                self.entries.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        let spec = &entry.spec;

        if spec.requires_api_key && is_blank(config.api_key.as_deref()) {
            return Err(RagError::Configuration(format!(
                "provider '{}' requires an api_key",
                spec.name
            )));
        }
        if spec.requires_endpoint && is_blank(config.endpoint_url.as_deref()) {
            return Err(RagError::Configuration(format!(
                "provider '{}' requires an endpoint_url",
                spec.name
            )));
        }
        if config.require_streaming && !spec.supports_streaming {
            return Err(RagError::Configuration(format!(
                "provider '{}' does not support streaming",
                spec.name
            )));
        }
        Ok(spec)
    }

    pub fn build(&self, config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, RagError> {
        let spec = self.validate(config)?;
        let entry = &self.entries[&spec.name];
        (entry.factory)(config, &entry.spec)
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}

fn spec(name: &str, description: &str) -> ProviderSpec {
    ProviderSpec {
        name: name.to_string(),
        description: description.to_string(),
        requires_api_key: false,
        requires_endpoint: false,
        default_endpoint: None,
        default_model: None,
        supports_streaming: true,
    }
}

impl ProviderSpec {
    fn api_key(mut self) -> Self {
        self.requires_api_key = true;
        self
    }

    fn endpoint(mut self) -> Self {
        self.requires_endpoint = true;
        self
    }

    fn endpoint_default(mut self, url: &str) -> Self {
        self.default_endpoint = Some(url.to_string());
        self
    }

    fn model_default(mut self, model: &str) -> Self {
        self.default_model = Some(model.to_string());
        self
    }

    fn resolve_model(&self, config: &ProviderConfig) -> String {
        config
            .model_name
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}

fn gemini(config: &ProviderConfig, _spec: &ProviderSpec) -> Result<Arc<dyn LlmProvider>, RagError> {
    Ok(Arc::new(GeminiProvider::new(config)?))
}

/// Ollama and LM Studio take a base URL; the chat route is appended.
fn local_server(
    config: &ProviderConfig,
    spec: &ProviderSpec,
) -> Result<Arc<dyn LlmProvider>, RagError> {
    let base = config
        .endpoint_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| spec.default_endpoint.clone())
        .ok_or_else(|| RagError::Configuration(format!("{} has no endpoint", spec.name)))?;
    let provider = OpenAiCompatProvider::new(
        &spec.name,
        OpenAiCompatProvider::chat_url(&base),
        spec.resolve_model(config),
        config,
    )?;
    Ok(Arc::new(provider))
}

/// Hosted and custom servers are configured with the exact endpoint.
fn full_endpoint(
    config: &ProviderConfig,
    spec: &ProviderSpec,
) -> Result<Arc<dyn LlmProvider>, RagError> {
    let url = config
        .endpoint_url
        .clone()
        .ok_or_else(|| RagError::Configuration(format!("{} has no endpoint", spec.name)))?;
    let provider = OpenAiCompatProvider::new(&spec.name, url, spec.resolve_model(config), config)?;
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_lists_every_provider() {
        let registry = ProviderRegistry::with_builtin();
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["custom", "gemini", "lmstudio", "ollama", "openai-compatible"]
        );
    }

    #[test]
    fn unknown_provider_is_invalid_request() {
        let registry = ProviderRegistry::with_builtin();
        let err = registry
            .build(&ProviderConfig::for_provider("anthropic-direct"))
            .err()
            .unwrap();
        assert_eq!(err.tag(), "InvalidRequest");
    }

    #[test]
    fn openai_compatible_requires_key_and_endpoint() {
        let registry = ProviderRegistry::with_builtin();
        let mut config = ProviderConfig::for_provider("openai-compatible");
        config.endpoint_url = Some("https://api.example.com/v1/chat/completions".to_string());
        assert!(registry.validate(&config).is_err());

        config.api_key = Some("sk-1".to_string());
        assert!(registry.validate(&config).is_ok());
    }

    #[test]
    fn local_servers_fall_back_to_catalog_defaults() {
        let registry = ProviderRegistry::with_builtin();
        let provider = registry
            .build(&ProviderConfig::for_provider("Ollama"))
            .unwrap();
        let info = provider.info();
        assert_eq!(info.provider, "ollama");
        assert_eq!(info.model, "llama2");
        assert_eq!(
            info.endpoint.as_deref(),
            Some("http://localhost:11434/v1/chat/completions")
        );
    }
}
