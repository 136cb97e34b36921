use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{next_timestamp, ConversationStore, NewTurn, Role, SourceRef, Turn, UserLocks};
use crate::core::errors::RagError;

pub struct SqliteConversationStore {
    pool: SqlitePool,
    locks: UserLocks,
    retention_cap: usize,
}

impl SqliteConversationStore {
    pub async fn new(db_path: PathBuf, retention_cap: usize) -> Result<Self, RagError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| RagError::history(format!("Failed to connect to history db: {}", e)))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS turns (
                user_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                sources TEXT NOT NULL DEFAULT '[]',
                incomplete INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, seq)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| RagError::history(format!("Failed to init turns table: {}", e)))?;

        Ok(Self {
            pool,
            locks: UserLocks::new(),
            retention_cap: retention_cap.max(1),
        })
    }

    fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, RagError> {
        let role: String = row.try_get("role").map_err(RagError::history)?;
        let timestamp: String = row.try_get("timestamp").map_err(RagError::history)?;
        let sources: String = row.try_get("sources").map_err(RagError::history)?;
        let incomplete: i64 = row.try_get("incomplete").map_err(RagError::history)?;

        Ok(Turn {
            user_id: row.try_get("user_id").map_err(RagError::history)?,
            seq: row.try_get("seq").map_err(RagError::history)?,
            role: Role::parse(&role)
                .ok_or_else(|| RagError::history(format!("unknown role '{}'", role)))?,
            content: row.try_get("content").map_err(RagError::history)?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(RagError::history)?
                .with_timezone(&Utc),
            sources: serde_json::from_str::<Vec<SourceRef>>(&sources).map_err(|e| {
                RagError::history(format!("corrupt sources for turn: {}", e))
            })?,
            incomplete: incomplete != 0,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append_all(&self, user_id: &str, turns: Vec<NewTurn>) -> Result<Vec<Turn>, RagError> {
        let _guard = self.locks.acquire(user_id).await;
        let mut tx = self.pool.begin().await.map_err(RagError::history)?;

        let last = sqlx::query(
            "SELECT seq, timestamp FROM turns WHERE user_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(RagError::history)?;

        let (mut seq, mut previous) = match last {
            Some(row) => {
                let seq: i64 = row.try_get("seq").map_err(RagError::history)?;
                let ts: String = row.try_get("timestamp").map_err(RagError::history)?;
                let ts = DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc))
                    .ok();
                (seq, ts)
            }
            None => (0, None),
        };

        let mut stored = Vec::with_capacity(turns.len());
        for turn in turns {
            seq += 1;
            let timestamp = next_timestamp(previous);
            previous = Some(timestamp);
            let sources = serde_json::to_string(&turn.sources).map_err(RagError::history)?;

            sqlx::query(
                "INSERT INTO turns (user_id, seq, role, content, timestamp, sources, incomplete)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id)
            .bind(seq)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .bind(format_timestamp(&timestamp))
            .bind(&sources)
            .bind(turn.incomplete as i64)
            .execute(&mut *tx)
            .await
            .map_err(RagError::history)?;

            stored.push(Turn {
                user_id: user_id.to_string(),
                seq,
                role: turn.role,
                content: turn.content,
                timestamp,
                sources: turn.sources,
                incomplete: turn.incomplete,
            });
        }

        sqlx::query("DELETE FROM turns WHERE user_id = ? AND seq <= ?")
            .bind(user_id)
            .bind(seq - self.retention_cap as i64)
            .execute(&mut *tx)
            .await
            .map_err(RagError::history)?;

        tx.commit().await.map_err(RagError::history)?;
        Ok(stored)
    }

    async fn get_recent(&self, user_id: &str, limit: usize) -> Result<Vec<Turn>, RagError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM (SELECT * FROM turns WHERE user_id = ? ORDER BY seq DESC LIMIT ?) ORDER BY seq ASC",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::history)?;

        rows.iter().map(Self::row_to_turn).collect()
    }

    async fn clear(&self, user_id: &str) -> Result<usize, RagError> {
        let _guard = self.locks.acquire(user_id).await;
        let result = sqlx::query("DELETE FROM turns WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(RagError::history)?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, user_id: &str) -> Result<usize, RagError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM turns WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(RagError::history)?;
        Ok(count as usize)
    }
}
