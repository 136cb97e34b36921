use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::config::{
    AppConfig, AppPaths, ConfigService, EmbedderKind, EmbeddingSettings, HistorySettings,
    StoreBackend,
};
use crate::core::errors::RagError;
use crate::embedding::{
    Embedder, EmbeddingIndex, HashingEmbedder, HttpEmbedder, MemoryVectorStore,
    SqliteVectorStore, VectorStore,
};
use crate::history::memory::MemoryConversationStore;
use crate::history::sqlite::SqliteConversationStore;
use crate::history::ConversationStore;
use crate::ingest::IngestService;
use crate::llm::{LlmGateway, ProviderRegistry};
use crate::rag::RagOrchestrator;

pub mod error;

use error::InitializationError;

/// Application state shared across all routes and background tasks.
///
/// Every component is constructed once here and injected; nothing reaches
/// for a global. Tests assemble their own with [`AppState::from_parts`].
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: ConfigService,
    pub settings: Arc<AppConfig>,
    pub index: Arc<EmbeddingIndex>,
    pub history: Arc<dyn ConversationStore>,
    pub gateway: Arc<LlmGateway>,
    pub orchestrator: Arc<RagOrchestrator>,
    pub ingest: IngestService,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Loads configuration from the default locations and opens every
    /// backend it selects.
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        let paths = Arc::new(AppPaths::new());
        let config = ConfigService::new(paths.clone());
        let settings = config.settings().map_err(InitializationError::Config)?;
        Self::from_settings(config, settings).await
    }

    pub async fn from_settings(
        config: ConfigService,
        settings: AppConfig,
    ) -> Result<Arc<Self>, InitializationError> {
        let paths = Arc::new(config.paths().clone());
        if let Err(e) = std::fs::create_dir_all(&paths.user_data_dir) {
            tracing::warn!("Failed to create data dir {}: {}", paths.user_data_dir.display(), e);
        }

        let history = open_history(&settings.history, &paths)
            .await
            .map_err(InitializationError::History)?;
        let index = Arc::new(
            open_index(&settings.embedding, &paths)
                .await
                .map_err(InitializationError::Index)?,
        );
        let gateway = Arc::new(
            LlmGateway::new(ProviderRegistry::with_builtin(), &settings.llm)
                .map_err(InitializationError::Llm)?,
        );

        Ok(Arc::new(Self::from_parts(
            paths, config, settings, index, history, gateway,
        )))
    }

    pub fn from_parts(
        paths: Arc<AppPaths>,
        config: ConfigService,
        settings: AppConfig,
        index: Arc<EmbeddingIndex>,
        history: Arc<dyn ConversationStore>,
        gateway: Arc<LlmGateway>,
    ) -> Self {
        let orchestrator = Arc::new(RagOrchestrator::new(
            index.clone(),
            history.clone(),
            gateway.clone(),
            settings.orchestrator.clone(),
        ));
        let ingest = IngestService::new(
            index.clone(),
            settings.ingest.page_size,
            settings.ingest.job_history,
        );

        tracing::info!(
            history_store = history.name(),
            provider = %gateway.current_info().provider,
            "Application state ready"
        );

        Self {
            paths,
            config,
            settings: Arc::new(settings),
            index,
            history,
            gateway,
            orchestrator,
            ingest,
            started_at: Utc::now(),
        }
    }
}

async fn open_history(
    settings: &HistorySettings,
    paths: &AppPaths,
) -> Result<Arc<dyn ConversationStore>, RagError> {
    Ok(match settings.store {
        StoreBackend::Sqlite => Arc::new(
            SqliteConversationStore::new(paths.history_db_path.clone(), settings.retention_cap)
                .await?,
        ),
        StoreBackend::Memory => Arc::new(MemoryConversationStore::new(settings.retention_cap)),
    })
}

async fn open_index(
    settings: &EmbeddingSettings,
    paths: &AppPaths,
) -> Result<EmbeddingIndex, RagError> {
    let embedder: Arc<dyn Embedder> = match settings.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(settings.dimensions)),
        EmbedderKind::Openai => {
            let endpoint = settings.endpoint.as_deref().ok_or_else(|| {
                RagError::Configuration(
                    "embedding.endpoint is required for the openai embedder".to_string(),
                )
            })?;
            Arc::new(HttpEmbedder::new(
                endpoint,
                settings.model.clone(),
                settings.api_key.clone(),
                settings.dimensions,
            )?)
        }
    };

    let store: Arc<dyn VectorStore> = match settings.store {
        StoreBackend::Sqlite => {
            Arc::new(SqliteVectorStore::with_path(paths.index_db_path.clone()).await?)
        }
        StoreBackend::Memory => Arc::new(MemoryVectorStore::new()),
    };

    Ok(EmbeddingIndex::new(embedder, store, settings.batch_size))
}
