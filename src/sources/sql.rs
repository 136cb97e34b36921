use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::mpsc;

use super::{validate_identifier, Record, RecordStream, SourceConnector};
use crate::core::errors::RagError;

/// A relational table read page by page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlSource {
    /// `sqlite://path.db`, a bare SQLite file path, or `postgres://...`.
    pub url: String,
    pub table: String,
    /// Columns to read (empty reads all).
    #[serde(default)]
    pub columns: Vec<String>,
    /// Paging order. SQLite falls back to `rowid`; Postgres reads in
    /// storage order when unset.
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SqlSource {
    pub(crate) fn validate(&self) -> Result<(), RagError> {
        if self.url.trim().is_empty() {
            return Err(RagError::InvalidRequest("sql source needs a url".to_string()));
        }
        validate_identifier(&self.table)?;
        for column in &self.columns {
            validate_identifier(column)?;
        }
        if let Some(order) = &self.order_by {
            validate_identifier(order)?;
        }
        Ok(())
    }
}

/// `schema.table` → `"schema"."table"`. Callers validate first.
fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join(".")
}

fn decode_row(raw: &str, row_number: usize) -> Result<Record, RagError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(_) => Err(RagError::RecordDecode(format!(
            "row {}: not a JSON object",
            row_number
        ))),
        Err(err) => Err(RagError::RecordDecode(format!("row {}: {}", row_number, err))),
    }
}

/// Page size for the next fetch given an optional overall cap.
fn next_page(page_size: usize, limit: Option<usize>, fetched: usize) -> usize {
    match limit {
        Some(max) => page_size.min(max.saturating_sub(fetched)),
        None => page_size,
    }
}

pub struct SqliteConnector {
    source: SqlSource,
}

impl SqliteConnector {
    pub fn new(source: SqlSource) -> Self {
        Self { source }
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions, RagError> {
        let url = self.source.url.trim();
        let options = if url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(url).map_err(RagError::source)?
        } else {
            SqliteConnectOptions::new().filename(url)
        };
        Ok(options.read_only(true).create_if_missing(false))
    }

    async fn resolve_columns(&self, pool: &SqlitePool) -> Result<Vec<String>, RagError> {
        if !self.source.columns.is_empty() {
            return Ok(self.source.columns.clone());
        }
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
                .bind(&self.source.table)
                .fetch_all(pool)
                .await
                .map_err(RagError::source)?;
        if columns.is_empty() {
            return Err(RagError::SourceUnavailable(format!(
                "table '{}' not found or has no columns",
                self.source.table
            )));
        }
        Ok(columns)
    }

    fn page_query(&self, columns: &[String]) -> String {
        let pairs = columns
            .iter()
            .map(|c| format!("'{}', {}", c, quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let order = self
            .source
            .order_by
            .as_deref()
            .map(quote_identifier)
            .unwrap_or_else(|| "rowid".to_string());
        format!(
            "SELECT json_object({}) FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2",
            pairs,
            quote_identifier(&self.source.table),
            order
        )
    }
}

#[async_trait]
impl SourceConnector for SqliteConnector {
    fn label(&self) -> String {
        format!("sqlite:{}", self.source.table)
    }

    async fn open(&self, page_size: usize) -> Result<RecordStream, RagError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options()?)
            .await
            .map_err(RagError::source)?;
        let columns = self.resolve_columns(&pool).await?;
        let sql = self.page_query(&columns);

        let page_size = page_size.max(1);
        let limit = self.source.limit;
        let (tx, rx) = mpsc::channel(page_size);

        tokio::spawn(async move {
            let mut fetched = 0usize;
            loop {
                let want = next_page(page_size, limit, fetched);
                if want == 0 {
                    break;
                }
                let rows: Vec<String> = match sqlx::query_scalar(&sql)
                    .bind(want as i64)
                    .bind(fetched as i64)
                    .fetch_all(&pool)
                    .await
                {
                    Ok(rows) => rows,
                    Err(err) => {
                        let _ = tx.send(Err(RagError::source(err))).await;
                        break;
                    }
                };

                let count = rows.len();
                for (offset, raw) in rows.iter().enumerate() {
                    if tx.send(decode_row(raw, fetched + offset + 1)).await.is_err() {
                        pool.close().await;
                        return;
                    }
                }
                fetched += count;
                if count < want {
                    break;
                }
            }
            pool.close().await;
        });

        Ok(rx)
    }
}

#[cfg(feature = "postgres")]
pub use postgres::PostgresConnector;

#[cfg(feature = "postgres")]
mod postgres {
    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;
    use tokio::sync::mpsc;

    use super::{decode_row, next_page, quote_identifier, SqlSource};
    use crate::core::errors::RagError;
    use crate::sources::{RecordStream, SourceConnector};

    pub struct PostgresConnector {
        source: SqlSource,
    }

    impl PostgresConnector {
        pub fn new(source: SqlSource) -> Self {
            Self { source }
        }

        fn page_query(&self) -> String {
            let projection = if self.source.columns.is_empty() {
                "*".to_string()
            } else {
                self.source
                    .columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let order = self
                .source
                .order_by
                .as_deref()
                .map(|o| format!(" ORDER BY {}", quote_identifier(o)))
                .unwrap_or_default();
            format!(
                "SELECT row_to_json(t)::text FROM (SELECT {} FROM {}{} LIMIT $1 OFFSET $2) t",
                projection,
                quote_identifier(&self.source.table),
                order
            )
        }
    }

    #[async_trait]
    impl SourceConnector for PostgresConnector {
        fn label(&self) -> String {
            format!("postgres:{}", self.source.table)
        }

        async fn open(&self, page_size: usize) -> Result<RecordStream, RagError> {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&self.source.url)
                .await
                .map_err(RagError::source)?;
            let sql = self.page_query();
            let page_size = page_size.max(1);
            let limit = self.source.limit;
            let (tx, rx) = mpsc::channel(page_size);

            tokio::spawn(async move {
                let mut fetched = 0usize;
                loop {
                    let want = next_page(page_size, limit, fetched);
                    if want == 0 {
                        break;
                    }
                    let rows: Vec<String> = match sqlx::query_scalar(&sql)
                        .bind(want as i64)
                        .bind(fetched as i64)
                        .fetch_all(&pool)
                        .await
                    {
                        Ok(rows) => rows,
                        Err(err) => {
                            let _ = tx.send(Err(RagError::source(err))).await;
                            break;
                        }
                    };

                    let count = rows.len();
                    for (offset, raw) in rows.iter().enumerate() {
                        if tx.send(decode_row(raw, fetched + offset + 1)).await.is_err() {
                            pool.close().await;
                            return;
                        }
                    }
                    fetched += count;
                    if count < want {
                        break;
                    }
                }
                pool.close().await;
            });

            Ok(rx)
        }
    }
}
