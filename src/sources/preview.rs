//! Source preview: connect, read the first few records and infer a
//! field → JSON kind schema, so a mapping can be written before ingesting.

use serde::Serialize;
use serde_json::Value;

use super::{connector_for, Record, SourceDescriptor};
use crate::core::errors::RagError;

pub const MAX_PREVIEW_ROWS: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    /// `string`, `number`, `boolean`, `array`, `object`, `null`, or `mixed`.
    pub kind: String,
    /// Sampled records that carry the field.
    pub present: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcePreview {
    pub source: String,
    pub fields: Vec<FieldInfo>,
    pub rows: Vec<Record>,
    pub decode_errors: usize,
}

/// Opens the source and samples up to `rows` records (capped at
/// [`MAX_PREVIEW_ROWS`]). Malformed records are counted, not returned.
pub async fn preview(descriptor: &SourceDescriptor, rows: usize) -> Result<SourcePreview, RagError> {
    let rows = rows.clamp(1, MAX_PREVIEW_ROWS);
    let connector = connector_for(descriptor)?;
    let mut stream = connector.open(rows).await?;

    let mut sample = Vec::with_capacity(rows);
    let mut decode_errors = 0;
    while sample.len() < rows {
        match stream.recv().await {
            Some(Ok(record)) => sample.push(record),
            Some(Err(RagError::RecordDecode(message))) => {
                tracing::debug!("preview skipped record: {}", message);
                decode_errors += 1;
            }
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }
    drop(stream);

    Ok(SourcePreview {
        source: connector.label(),
        fields: infer_fields(&sample),
        rows: sample,
        decode_errors,
    })
}

/// Fields in first-seen order. Nulls do not change a field's kind; two
/// different non-null kinds make it `mixed`.
pub fn infer_fields(records: &[Record]) -> Vec<FieldInfo> {
    let mut fields: Vec<FieldInfo> = Vec::new();
    for record in records {
        for (name, value) in record {
            let kind = kind_of(value);
            match fields.iter_mut().find(|field| &field.name == name) {
                Some(field) => {
                    field.present += 1;
                    if field.kind == "null" {
                        field.kind = kind.to_string();
                    } else if kind != "null" && field.kind != kind {
                        field.kind = "mixed".to_string();
                    }
                }
                None => fields.push(FieldInfo {
                    name: name.clone(),
                    kind: kind.to_string(),
                    present: 1,
                }),
            }
        }
    }
    fields
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{CsvSource, JsonlSource};
    use serde_json::json;
    use std::io::Write;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn kinds_merge_across_records() {
        let fields = infer_fields(&[
            record(json!({ "id": 1, "note": null, "tag": "a" })),
            record(json!({ "id": 2, "note": "late", "tag": 7 })),
            record(json!({ "id": 3, "extra": [1] })),
        ]);
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["id", "note", "tag", "extra"]);
        assert_eq!(fields[0].kind, "number");
        assert_eq!(fields[0].present, 3);
        assert_eq!(fields[1].kind, "string");
        assert_eq!(fields[2].kind, "mixed");
        assert_eq!(fields[3].kind, "array");
        assert_eq!(fields[3].present, 1);
    }

    #[tokio::test]
    async fn preview_samples_first_rows_of_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"account,quarter,revenue\na1,Q3,1200\na2,Q3\na3,Q4,900\na4,Q1,10\n")
            .unwrap();
        let descriptor = SourceDescriptor::Csv(CsvSource::new(file.path()));

        let preview = preview(&descriptor, 2).await.unwrap();
        assert_eq!(preview.rows.len(), 2);
        assert_eq!(preview.rows[1]["account"], "a3");
        assert_eq!(preview.decode_errors, 1);
        assert_eq!(preview.fields.len(), 3);
        assert!(preview.fields.iter().all(|f| f.kind == "string"));
    }

    #[tokio::test]
    async fn preview_of_missing_source_is_unavailable() {
        let descriptor = SourceDescriptor::Jsonl(JsonlSource::new("/nonexistent/docs.jsonl"));
        let err = preview(&descriptor, 5).await.unwrap_err();
        assert_eq!(err.tag(), "SourceUnavailable");
    }
}
