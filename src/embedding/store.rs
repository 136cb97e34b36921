//! Vector persistence behind the embedding index.

use async_trait::async_trait;

use super::{Document, ScoredDocument};
use crate::core::errors::RagError;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name reported in index stats.
    fn name(&self) -> &str;

    /// Inserts or replaces by document id. Each document's vector and
    /// metadata land together or not at all.
    async fn upsert(&self, items: Vec<(Document, Vec<f32>)>) -> Result<usize, RagError>;

    /// Top `k` documents by descending cosine similarity, ties by id.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>, RagError>;

    async fn delete(&self, id: &str) -> Result<bool, RagError>;

    /// Removes everything, returning the number of documents dropped.
    async fn clear(&self) -> Result<usize, RagError>;

    async fn count(&self) -> Result<usize, RagError>;
}
