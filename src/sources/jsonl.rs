use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::{project, Record, RecordStream, SourceConnector};
use crate::core::errors::RagError;

/// A document collection exported as newline-delimited JSON objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlSource {
    pub path: PathBuf,
    /// Top-level fields to keep (empty keeps all).
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fields: Vec::new(),
            limit: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RagError> {
        if self.fields.iter().any(|f| f.trim().is_empty()) {
            return Err(RagError::InvalidRequest(
                "jsonl field names cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn decode_line(raw: &[u8], number: usize) -> Result<Record, RagError> {
    let line = std::str::from_utf8(raw)
        .map_err(|err| RagError::RecordDecode(format!("line {}: {}", number, err)))?;
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(_) => Err(RagError::RecordDecode(format!(
            "line {}: expected a JSON object",
            number
        ))),
        Err(err) => Err(RagError::RecordDecode(format!("line {}: {}", number, err))),
    }
}

#[async_trait]
impl SourceConnector for JsonlSource {
    fn label(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }

    async fn open(&self, page_size: usize) -> Result<RecordStream, RagError> {
        let file = File::open(&self.path).await.map_err(|e| {
            RagError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;

        let (tx, rx) = mpsc::channel(page_size.max(1));
        let fields = self.fields.clone();
        let limit = self.limit;

        tokio::spawn(async move {
            let mut reader = BufReader::new(file);
            let mut line = Vec::new();
            let mut number = 0usize;
            let mut emitted = 0usize;

            loop {
                if limit.is_some_and(|max| emitted >= max) {
                    return;
                }
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => return,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx.send(Err(RagError::source(err))).await;
                        return;
                    }
                }
                number += 1;
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }

                let item = decode_line(&line, number).map(|r| project(r, &fields));
                emitted += 1;
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
