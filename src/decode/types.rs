//! Decoder types
//!
//! A sales page decodes into records that each carry a business timestamp,
//! plus the cursor for the next page.

use crate::types::{Cursor, JsonValue, TimestampFormat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sale as returned by the API.
///
/// The payload is opaque to the engine; only the timestamp and key are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    /// Natural business key (e.g. the sale id), when the record has one
    pub key: Option<String>,
    /// Business timestamp used for early-exit decisions
    pub timestamp: DateTime<Utc>,
    /// Raw record as received
    pub payload: JsonValue,
}

impl ExtractedRecord {
    /// Create a new record
    pub fn new(key: Option<String>, timestamp: DateTime<Utc>, payload: JsonValue) -> Self {
        Self {
            key,
            timestamp,
            payload,
        }
    }

    /// Key used for idempotent loads; falls back to the payload text
    pub fn dedupe_key(&self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => self.payload.to_string(),
        }
    }
}

/// Records and continuation token of one decoded page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPage {
    /// Records in API order
    pub records: Vec<ExtractedRecord>,
    /// Cursor for the following page, if the API returned one
    pub next_cursor: Option<Cursor>,
}

/// Where to find things in a page body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Path to the record array (`data`, `$.result.sales`, `$.pages[*].items`)
    #[serde(default = "default_records_path")]
    pub records_path: String,
    /// Path to the next-page cursor
    #[serde(default = "default_cursor_path")]
    pub next_cursor_path: String,
    /// Record field holding the business timestamp (dot paths allowed)
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Encoding of the timestamp field
    #[serde(default)]
    pub timestamp_format: TimestampFormat,
    /// Record field holding the natural key
    #[serde(default = "default_key_field")]
    pub key_field: Option<String>,
}

fn default_records_path() -> String {
    "data".to_string()
}

fn default_cursor_path() -> String {
    "next_cursor".to_string()
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_key_field() -> Option<String> {
    Some("id".to_string())
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            records_path: default_records_path(),
            next_cursor_path: default_cursor_path(),
            timestamp_field: default_timestamp_field(),
            timestamp_format: TimestampFormat::default(),
            key_field: default_key_field(),
        }
    }
}
