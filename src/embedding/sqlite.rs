//! SQLite-backed vector store.
//!
//! Single-file store: metadata as JSON text, vectors as little-endian f32
//! blobs, brute-force cosine scan for search.

use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::similarity::{cosine_similarity, rank};
use super::store::VectorStore;
use super::{Document, ScoredDocument};
use crate::core::errors::RagError;

/// Scan results are re-ranked and cut back to `k` whenever this many
/// multiples of `k` accumulate, bounding memory during a search.
const RANK_SLACK: usize = 4;

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub async fn with_path(db_path: PathBuf) -> Result<Self, RagError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(RagError::retrieval)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), RagError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(RagError::retrieval)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
        let metadata_str: String = row.get("metadata");
        let metadata = match serde_json::from_str::<Value>(&metadata_str) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Document {
            id: row.get("id"),
            text: row.get("text"),
            metadata,
        }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, items: Vec<(Document, Vec<f32>)>) -> Result<usize, RagError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(RagError::retrieval)?;
        for (document, embedding) in &items {
            let metadata = serde_json::to_string(&document.metadata).map_err(RagError::retrieval)?;
            sqlx::query(
                "INSERT OR REPLACE INTO documents (id, text, metadata, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            )
            .bind(&document.id)
            .bind(&document.text)
            .bind(&metadata)
            .bind(Self::serialize_embedding(embedding))
            .execute(&mut *tx)
            .await
            .map_err(RagError::retrieval)?;
        }
        tx.commit().await.map_err(RagError::retrieval)?;

        Ok(items.len())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>, RagError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut rows = sqlx::query("SELECT id, text, metadata, embedding FROM documents")
            .fetch(&self.pool);

        let mut scored = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(RagError::retrieval)? {
            let embedding_bytes: Vec<u8> = row.get("embedding");
            let stored = Self::deserialize_embedding(&embedding_bytes);
            scored.push(ScoredDocument {
                document: Self::row_to_document(&row),
                score: cosine_similarity(query, &stored),
            });
            if scored.len() >= k * RANK_SLACK {
                scored = rank(scored, k);
            }
        }

        Ok(rank(scored, k))
    }

    async fn delete(&self, id: &str) -> Result<bool, RagError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(RagError::retrieval)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<usize, RagError> {
        let result = sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await
            .map_err(RagError::retrieval)?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, RagError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(RagError::retrieval)?;
        Ok(count as usize)
    }
}
