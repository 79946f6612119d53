//! Page decoder implementation

use super::types::{DecodedPage, DecoderConfig, ExtractedRecord};
use crate::error::{Error, Result};
use crate::types::Cursor;
use serde_json::Value;

/// Decodes sales API page bodies
#[derive(Debug, Clone, Default)]
pub struct PageDecoder {
    config: DecoderConfig,
}

impl PageDecoder {
    /// Create a decoder with the given field layout
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    /// Get the decoder configuration
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decode a raw response body
    pub fn decode(&self, body: &str) -> Result<DecodedPage> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::decode(format!("Failed to parse JSON: {e}")))?;
        self.decode_value(&value)
    }

    /// Decode an already-parsed response body
    pub fn decode_value(&self, value: &Value) -> Result<DecodedPage> {
        let raw_records = self.extract_records(value)?;
        let records = raw_records
            .into_iter()
            .map(|raw| self.to_record(raw))
            .collect::<Result<Vec<_>>>()?;

        let next_cursor = extract_simple_path(value, &self.config.next_cursor_path)
            .and_then(|v| scalar_to_string(&v))
            .filter(|s| !s.is_empty())
            .map(Cursor::from);

        Ok(DecodedPage {
            records,
            next_cursor,
        })
    }

    fn extract_records(&self, value: &Value) -> Result<Vec<Value>> {
        let path = self.config.records_path.as_str();
        if path.is_empty() || path == "$" {
            return match value {
                Value::Array(arr) => Ok(arr.clone()),
                Value::Null => Ok(vec![]),
                _ => Ok(vec![value.clone()]),
            };
        }

        // Only use jsonpath-rust for complex patterns like wildcards
        if path.contains('*') && !path.contains("[-") {
            return extract_with_jsonpath(value, path);
        }

        match extract_simple_path(value, path) {
            Some(Value::Array(arr)) => Ok(arr),
            Some(Value::Null) | None => Ok(vec![]),
            Some(other) => Err(Error::decode(format!(
                "Expected an array at '{path}', found {}",
                json_kind(&other)
            ))),
        }
    }

    fn to_record(&self, raw: Value) -> Result<ExtractedRecord> {
        let field = &self.config.timestamp_field;
        let ts_value =
            extract_simple_path(&raw, field).ok_or_else(|| Error::RecordTimestamp {
                field: field.clone(),
                message: "field missing".to_string(),
            })?;
        let timestamp = self
            .config
            .timestamp_format
            .parse(&ts_value)
            .ok_or_else(|| Error::RecordTimestamp {
                field: field.clone(),
                message: format!(
                    "cannot parse {ts_value} as {:?}",
                    self.config.timestamp_format
                ),
            })?;

        let key = self
            .config
            .key_field
            .as_deref()
            .and_then(|k| extract_simple_path(&raw, k))
            .and_then(|v| scalar_to_string(&v));

        Ok(ExtractedRecord::new(key, timestamp, raw))
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Walk a dot path such as `data.items[0]` or `$.meta.cursor`
fn extract_simple_path(value: &Value, path: &str) -> Option<Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let mut current = value;

    for part in path.split('.') {
        // Handle array indexing like "data[0]" or "items[-1]"
        if let Some(bracket_pos) = part.find('[') {
            let name = &part[..bracket_pos];
            let index_str = part[bracket_pos + 1..].trim_end_matches(']');

            if !name.is_empty() {
                current = current.get(name)?;
            }

            let index: i64 = index_str.parse().ok()?;
            let Value::Array(arr) = current else {
                return None;
            };
            #[allow(clippy::cast_possible_wrap)]
            let idx = if index < 0 {
                usize::try_from(arr.len() as i64 + index).ok()?
            } else {
                usize::try_from(index).ok()?
            };
            current = arr.get(idx)?;
        } else {
            current = current.get(part)?;
        }
    }

    Some(current.clone())
}

/// Extract records using jsonpath-rust
fn extract_with_jsonpath(value: &Value, path: &str) -> Result<Vec<Value>> {
    use jsonpath_rust::JsonPath;

    let jp = JsonPath::try_from(path)
        .map_err(|e| Error::json_path(format!("Invalid JSONPath: {e}")))?;

    match jp.find(value) {
        Value::Array(arr) => Ok(arr),
        Value::Null => Ok(vec![]),
        other => Ok(vec![other]),
    }
}
