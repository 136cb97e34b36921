use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::similarity::{cosine_similarity, rank};
use super::store::VectorStore;
use super::{Document, ScoredDocument};
use crate::core::errors::RagError;

/// In-process store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<HashMap<String, (Document, Vec<f32>)>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, items: Vec<(Document, Vec<f32>)>) -> Result<usize, RagError> {
        let count = items.len();
        let mut entries = self.entries.write().await;
        for (document, vector) in items {
            entries.insert(document.id.clone(), (document, vector));
        }
        Ok(count)
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>, RagError> {
        let entries = self.entries.read().await;
        let scored = entries
            .values()
            .map(|(document, vector)| ScoredDocument {
                document: document.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();
        Ok(rank(scored, k))
    }

    async fn delete(&self, id: &str) -> Result<bool, RagError> {
        Ok(self.entries.write().await.remove(id).is_some())
    }

    async fn clear(&self) -> Result<usize, RagError> {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, RagError> {
        Ok(self.entries.read().await.len())
    }
}
