use std::sync::{Arc, RwLock};

use super::provider::LlmProvider;
use super::registry::ProviderRegistry;
use super::types::{ChatRequest, ProviderConfig, ProviderInfo, ProviderSpec, TextStream};
use crate::core::errors::RagError;

struct Active {
    provider: Arc<dyn LlmProvider>,
    config: Option<ProviderConfig>,
}

/// Front door to the active language-model backend.
///
/// The active provider sits behind one swappable `Arc`. Each request clones
/// it once, so a switch never affects generations already in flight.
pub struct LlmGateway {
    registry: ProviderRegistry,
    active: RwLock<Active>,
}

impl LlmGateway {
    pub fn new(registry: ProviderRegistry, config: &ProviderConfig) -> Result<Self, RagError> {
        let provider = registry.build(config)?;
        tracing::info!(provider = provider.name(), "LLM provider activated");
        Ok(Self {
            registry,
            active: RwLock::new(Active {
                provider,
                config: Some(config.clone()),
            }),
        })
    }

    /// Gateway around an already-built provider (tests, embedding hosts).
    pub fn with_provider(registry: ProviderRegistry, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            registry,
            active: RwLock::new(Active {
                provider,
                config: None,
            }),
        }
    }

    pub fn current(&self) -> Arc<dyn LlmProvider> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        guard.provider.clone()
    }

    pub fn current_info(&self) -> ProviderInfo {
        self.current().info()
    }

    pub fn current_config(&self) -> Option<ProviderConfig> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        guard.config.clone()
    }

    pub fn providers(&self) -> Vec<ProviderSpec> {
        self.registry.specs()
    }

    /// Validates `config` against the provider's declared capabilities and,
    /// only if that succeeds, replaces the active provider.
    pub fn switch(&self, config: ProviderConfig) -> Result<ProviderInfo, RagError> {
        let provider = self.registry.build(&config)?;
        let info = provider.info();

        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        let previous = guard.provider.name().to_string();
        *guard = Active {
            provider,
            config: Some(config),
        };
        drop(guard);

        tracing::info!(from = %previous, to = %info.provider, model = %info.model, "LLM provider switched");
        Ok(info)
    }

    pub async fn generate(&self, request: ChatRequest) -> Result<String, RagError> {
        self.current().generate(request).await
    }

    pub async fn generate_stream(&self, request: ChatRequest) -> Result<TextStream, RagError> {
        self.current().generate_stream(request).await
    }
}
