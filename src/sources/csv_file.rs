use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{project, Record, RecordStream, SourceConnector};
use crate::core::errors::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Json,
}

/// A delimited text file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSource {
    pub path: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub has_header: bool,
    /// Raw lines skipped before the header (or first record).
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Column names for header-less files; otherwise the columns to keep
    /// (empty keeps all).
    #[serde(default)]
    pub columns: Vec<String>,
    /// Optional coercion per column; untyped columns stay strings.
    #[serde(default)]
    pub column_types: BTreeMap<String, CsvColumnType>,
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: default_delimiter(),
            has_header: true,
            skip_rows: 0,
            max_rows: None,
            columns: Vec::new(),
            column_types: BTreeMap::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RagError> {
        if !self.delimiter.is_ascii() {
            return Err(RagError::InvalidRequest(
                "csv delimiter must be a single ASCII character".to_string(),
            ));
        }
        if !self.has_header && self.columns.is_empty() {
            return Err(RagError::InvalidRequest(
                "csv files without a header need declared columns".to_string(),
            ));
        }
        Ok(())
    }

    fn read_blocking(&self, file: File, tx: mpsc::Sender<Result<Record, RagError>>) {
        let mut reader = BufReader::new(file);
        let mut skipped = String::new();
        for _ in 0..self.skip_rows {
            skipped.clear();
            match reader.read_line(&mut skipped) {
                Ok(0) => return,
                Ok(_) => {}
                Err(err) => {
                    let _ = tx.blocking_send(Err(RagError::source(err)));
                    return;
                }
            }
        }

        let mut csv_reader = ::csv::ReaderBuilder::new()
            .delimiter(self.delimiter as u8)
            .has_headers(self.has_header)
            .from_reader(reader);

        let header: Vec<String> = if self.has_header {
            match csv_reader.headers() {
                Ok(row) => row.iter().map(|h| h.trim().to_string()).collect(),
                Err(err) => {
                    let _ = tx.blocking_send(Err(RagError::source(err)));
                    return;
                }
            }
        } else {
            self.columns.clone()
        };
        let keep: &[String] = if self.has_header { &self.columns } else { &[] };

        for (index, row) in csv_reader.records().enumerate() {
            if self.max_rows.is_some_and(|max| index >= max) {
                break;
            }
            let item = match row {
                Ok(row) => self.decode(&header, &row, index).map(|r| project(r, keep)),
                Err(err) if err.is_io_error() => {
                    let _ = tx.blocking_send(Err(RagError::source(err)));
                    return;
                }
                Err(err) => Err(RagError::RecordDecode(format!("row {}: {}", index + 1, err))),
            };
            if tx.blocking_send(item).is_err() {
                return;
            }
        }
    }

    fn decode(
        &self,
        header: &[String],
        row: &::csv::StringRecord,
        index: usize,
    ) -> Result<Record, RagError> {
        if row.len() != header.len() {
            return Err(RagError::RecordDecode(format!(
                "row {}: expected {} fields, found {}",
                index + 1,
                header.len(),
                row.len()
            )));
        }

        let mut record = Record::new();
        for (name, raw) in header.iter().zip(row.iter()) {
            let value = match self.column_types.get(name) {
                Some(kind) => coerce(*kind, raw).ok_or_else(|| {
                    RagError::RecordDecode(format!(
                        "row {}: column '{}' is not a valid {:?}",
                        index + 1,
                        name,
                        kind
                    ))
                })?,
                None if raw.is_empty() => Value::Null,
                None => Value::String(raw.to_string()),
            };
            record.insert(name.clone(), value);
        }
        Ok(record)
    }
}

fn coerce(kind: CsvColumnType, raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Value::Null);
    }
    match kind {
        CsvColumnType::Text => Some(Value::String(raw.to_string())),
        CsvColumnType::Integer => raw.parse::<i64>().ok().map(Value::from),
        CsvColumnType::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        CsvColumnType::Boolean => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Some(Value::Bool(true)),
            "false" | "0" | "no" | "n" => Some(Value::Bool(false)),
            _ => None,
        },
        CsvColumnType::Json => serde_json::from_str(raw).ok(),
    }
}

#[async_trait]
impl SourceConnector for CsvSource {
    fn label(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    async fn open(&self, page_size: usize) -> Result<RecordStream, RagError> {
        let file = File::open(&self.path).map_err(|e| {
            RagError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let (tx, rx) = mpsc::channel(page_size.max(1));
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read_blocking(file, tx));
        Ok(rx)
    }
}
