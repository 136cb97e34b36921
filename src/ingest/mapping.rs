use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::embedding::Document;
use crate::sources::Record;

/// Which record fields feed the embedding text, the metadata and the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub text_fields: Vec<String>,
    /// `None` keeps every field.
    #[serde(default)]
    pub metadata_fields: Option<Vec<String>>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl FieldMapping {
    pub fn new<I, S>(text_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text_fields: text_fields.into_iter().map(Into::into).collect(),
            metadata_fields: None,
            id_field: default_id_field(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.text_fields.is_empty() {
            return Err("field mapping needs at least one text field".to_string());
        }
        if self.text_fields.iter().any(|f| f.trim().is_empty()) {
            return Err("text field names cannot be empty".to_string());
        }
        Ok(())
    }

    /// Turns a source record into a document. The text may be empty; the
    /// index rejects those.
    pub fn to_document(&self, source_label: &str, record: &Record) -> Document {
        let text = self
            .text_fields
            .iter()
            .filter_map(|field| {
                let value = record.get(field).and_then(render_value)?;
                Some(format!("{}: {}", field, value))
            })
            .collect::<Vec<_>>()
            .join(" | ");

        let id = record
            .get(&self.id_field)
            .and_then(render_value)
            .unwrap_or_else(|| content_id(source_label, record));

        let metadata = match &self.metadata_fields {
            None => record.clone(),
            Some(fields) => fields
                .iter()
                .filter_map(|field| record.get(field).map(|v| (field.clone(), v.clone())))
                .collect::<Map<String, Value>>(),
        };

        Document { id, text, metadata }
    }
}

/// Scalar rendering used for text and ids; `None` for null and blank values.
fn render_value(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    };
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

/// Stable id for records without an id field. serde_json maps serialise
/// with sorted keys, so equal records hash equally across runs.
fn content_id(source_label: &str, record: &Record) -> String {
    let canonical = serde_json::to_string(record).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(source_label.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
