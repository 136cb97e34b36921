//! Source connectors: stream records (field → JSON value) out of tabular and
//! document stores without materialising the whole source.
//!
//! A connector is opened once per ingestion run. `open` performs the connect
//! step (failure → `SourceUnavailable`) and hands back a bounded channel fed
//! by a producer task. Items are:
//! - `Ok(record)` for every decoded record,
//! - `Err(RecordDecodeError)` for a malformed record (consumer skips it),
//! - `Err(SourceUnavailable)` when the source is lost mid-stream (always last).
//!
//! Dropping the receiver stops the producer at its next send.

pub mod csv_file;
pub mod jsonl;
pub mod preview;
pub mod sql;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::core::errors::RagError;

pub use self::csv_file::{CsvColumnType, CsvSource};
pub use self::jsonl::JsonlSource;
pub use self::preview::{preview, FieldInfo, SourcePreview};
pub use self::sql::SqlSource;

pub type Record = Map<String, Value>;
pub type RecordStream = mpsc::Receiver<Result<Record, RagError>>;

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Stable, credential-free name used in logs and document ids.
    fn label(&self) -> String;

    /// Connects and starts streaming; `page_size` bounds both the fetch
    /// size and the channel capacity.
    async fn open(&self, page_size: usize) -> Result<RecordStream, RagError>;
}

/// Connection parameters plus the fields to read, tagged by source `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    Csv(CsvSource),
    Sqlite(SqlSource),
    Postgres(SqlSource),
    Jsonl(JsonlSource),
}

impl SourceDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceDescriptor::Csv(_) => "csv",
            SourceDescriptor::Sqlite(_) => "sqlite",
            SourceDescriptor::Postgres(_) => "postgres",
            SourceDescriptor::Jsonl(_) => "jsonl",
        }
    }
}

/// Builds the connector for a descriptor, validating it first.
pub fn connector_for(descriptor: &SourceDescriptor) -> Result<Box<dyn SourceConnector>, RagError> {
    match descriptor {
        SourceDescriptor::Csv(source) => {
            source.validate()?;
            Ok(Box::new(source.clone()))
        }
        SourceDescriptor::Sqlite(source) => {
            source.validate()?;
            Ok(Box::new(sql::SqliteConnector::new(source.clone())))
        }
        SourceDescriptor::Postgres(source) => {
            source.validate()?;
            postgres_connector(source)
        }
        SourceDescriptor::Jsonl(source) => {
            source.validate()?;
            Ok(Box::new(source.clone()))
        }
    }
}

#[cfg(feature = "postgres")]
fn postgres_connector(source: &SqlSource) -> Result<Box<dyn SourceConnector>, RagError> {
    Ok(Box::new(sql::PostgresConnector::new(source.clone())))
}

#[cfg(not(feature = "postgres"))]
fn postgres_connector(_source: &SqlSource) -> Result<Box<dyn SourceConnector>, RagError> {
    Err(RagError::Configuration(
        "postgres sources need the `postgres` cargo feature".to_string(),
    ))
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("identifier pattern is valid")
    })
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<(), RagError> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(RagError::InvalidRequest(format!(
            "invalid identifier '{}'",
            name
        )))
    }
}

/// Keeps only `fields` (all fields when empty).
pub(crate) fn project(record: Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record;
    }
    let mut record = record;
    fields
        .iter()
        .filter_map(|field| record.remove(field).map(|value| (field.clone(), value)))
        .collect()
}
