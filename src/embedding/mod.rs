//! Embedding index: an [`Embedder`] composed with a [`VectorStore`].

pub mod embedder;
pub mod memory;
pub mod similarity;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::RagError;

pub use embedder::{Embedder, HashingEmbedder, HttpEmbedder};
pub use memory::MemoryVectorStore;
pub use sqlite::SqliteVectorStore;
pub use store::VectorStore;

/// Unit of retrieval. Immutable once embedded; re-ingesting the same id
/// replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Embedding input.
    pub text: String,
    /// Source fields, preserved verbatim.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDocument {
    #[serde(flatten)]
    pub document: Document,
    pub score: f32,
}

/// Retrieval result: highest score first.
pub type Retrieval = Vec<ScoredDocument>;

#[derive(Debug, Clone, Default)]
pub struct EmbedReport {
    pub stored: usize,
    /// Documents refused before embedding (`EmptyContentError`).
    pub rejected: Vec<RagError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub document_count: usize,
    pub embedding_model: String,
    pub dimensions: usize,
    pub store: String,
}

pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    batch_size: usize,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>, batch_size: usize) -> Self {
        Self {
            embedder,
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// In-memory index with the hashing embedder.
    pub fn in_memory(dimensions: usize) -> Self {
        Self::new(
            Arc::new(HashingEmbedder::new(dimensions)),
            Arc::new(MemoryVectorStore::new()),
            100,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embeds and stores `documents` in batches of `batch_size`.
    ///
    /// Documents with blank text are rejected individually; the rest
    /// proceed. On a backend failure, batches already stored stay stored
    /// and the error is returned.
    pub async fn embed_and_store(&self, documents: Vec<Document>) -> Result<EmbedReport, RagError> {
        let mut report = EmbedReport::default();
        let (accepted, rejected): (Vec<Document>, Vec<Document>) = documents
            .into_iter()
            .partition(|d| !d.text.trim().is_empty());

        for document in rejected {
            tracing::warn!(document_id = %document.id, "Rejected document with empty text");
            report.rejected.push(RagError::EmptyContent(document.id));
        }

        let mut accepted = accepted.into_iter().peekable();
        while accepted.peek().is_some() {
            let batch: Vec<Document> = accepted.by_ref().take(self.batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(RagError::retrieval(format!(
                    "embedder returned {} vectors for {} documents",
                    vectors.len(),
                    batch.len()
                )));
            }

            let items: Vec<(Document, Vec<f32>)> = batch.into_iter().zip(vectors).collect();
            report.stored += self.store.upsert(items).await?;
        }

        tracing::debug!(stored = report.stored, rejected = report.rejected.len(), "Embedded batch");
        Ok(report)
    }

    /// Top `k` documents for `query`, most relevant first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Retrieval, RagError> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| RagError::retrieval("embedder returned no query vector"))?;
        self.store.search(&vector, k).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, RagError> {
        self.store.delete(id).await
    }

    pub async fn clear(&self) -> Result<usize, RagError> {
        let removed = self.store.clear().await?;
        tracing::info!(removed, "Embedding index cleared");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<IndexStats, RagError> {
        Ok(IndexStats {
            document_count: self.store.count().await?,
            embedding_model: self.embedder.model().to_string(),
            dimensions: self.embedder.dimensions(),
            store: self.store.name().to_string(),
        })
    }
}
