//! Typed view of the merged configuration document.
//!
//! Every section deserialises with serde defaults, so a missing `config.yml`
//! yields a runnable local setup (hashing embedder, SQLite stores, Ollama).

use serde::{Deserialize, Serialize};

use crate::llm::ProviderConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub llm: ProviderConfig,
    pub embedding: EmbeddingSettings,
    pub history: HistorySettings,
    pub orchestrator: OrchestratorSettings,
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    #[default]
    Hashing,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub embedder: EmbedderKind,
    pub model: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub dimensions: usize,
    /// Documents embedded per backend call.
    pub batch_size: usize,
    pub store: StoreBackend,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            embedder: EmbedderKind::Hashing,
            model: "all-MiniLM-L6-v2".to_string(),
            endpoint: None,
            api_key: None,
            dimensions: 384,
            batch_size: 100,
            store: StoreBackend::Sqlite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub store: StoreBackend,
    /// Turns kept per user; older turns are evicted on append.
    pub retention_cap: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            store: StoreBackend::Sqlite,
            retention_cap: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub max_results: usize,
    /// Turns rendered into the prompt (5 exchanges).
    pub history_turns: usize,
    pub history_timeout_ms: u64,
    pub search_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub retry_dependencies: bool,
    pub retry_backoff_ms: u64,
    pub persist_partial_on_cancel: bool,
    pub max_context_chars: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_results: 5,
            history_turns: 10,
            history_timeout_ms: 2_000,
            search_timeout_ms: 5_000,
            generation_timeout_ms: 60_000,
            retry_dependencies: true,
            retry_backoff_ms: 100,
            persist_partial_on_cancel: true,
            max_context_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub page_size: usize,
    /// Finished jobs remembered for status queries.
    pub job_history: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            job_history: 50,
        }
    }
}
