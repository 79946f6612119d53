//! Common types used throughout salesync
//!
//! This module contains shared type definitions, type aliases,
//! and utility types used across multiple modules.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Type Aliases
// ============================================================================

/// JSON value type (re-exported from serde_json)
pub type JsonValue = serde_json::Value;

/// JSON object type
pub type JsonObject = serde_json::Map<String, JsonValue>;

// ============================================================================
// Cursor
// ============================================================================

/// Opaque pagination token returned by the sales API.
///
/// In practice the API hands out hex-encoded unix timestamps (`0x5bb16380`),
/// but the value is stored verbatim and only decoded for ordering checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a raw cursor token
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Encode a timestamp the way the API does (hex seconds, `0x` prefix)
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(format!("0x{:x}", ts.timestamp().max(0)))
    }

    /// Raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decoded stream position, if the token is hex
    pub fn position(&self) -> Option<u128> {
        let raw = self.0.trim();
        let hex = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        if hex.is_empty() {
            return None;
        }
        u128::from_str_radix(hex, 16).ok()
    }

    /// Timestamp the cursor points at, when it decodes as hex seconds
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.position()?).ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }

    /// Order two cursors by stream position.
    ///
    /// Falls back to plain string comparison when either side is not hex.
    pub fn compare(&self, other: &Cursor) -> Ordering {
        match (self.position(), other.position()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }

    /// True when `self` sits strictly before `other` in the stream
    pub fn is_before(&self, other: &Cursor) -> bool {
        self.compare(other) == Ordering::Less
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Cursor {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Date Range
// ============================================================================

/// Inclusive calendar window a job is syncing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First day of the window
    pub start: NaiveDate,
    /// Last day of the window (inclusive)
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a new date range
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Midnight UTC of the first day
    pub fn start_timestamp(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start.and_time(chrono::NaiveTime::MIN))
    }

    /// First instant that lies beyond `end + buffer_days`.
    ///
    /// A record at or after this instant is outside the window plus its grace period.
    pub fn early_exit_threshold(&self, buffer_days: u32) -> DateTime<Utc> {
        let boundary = self
            .end
            .checked_add_days(Days::new(u64::from(buffer_days) + 1))
            .unwrap_or(NaiveDate::MAX);
        Utc.from_utc_datetime(&boundary.and_time(chrono::NaiveTime::MIN))
    }

    /// Whether a timestamp falls inside the window
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let day = ts.date_naive();
        day >= self.start && day <= self.end
    }

    /// Number of days covered (inclusive)
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ============================================================================
// Timestamp Format
// ============================================================================

/// Encoding of the business timestamp inside a sales record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// ISO 8601 datetime string
    #[default]
    Iso8601,
    /// Unix timestamp (seconds)
    Unix,
    /// Unix timestamp (milliseconds)
    UnixMs,
}

impl TimestampFormat {
    /// Parse a JSON value into a UTC timestamp
    pub fn parse(self, value: &JsonValue) -> Option<DateTime<Utc>> {
        match self {
            TimestampFormat::Iso8601 => value.as_str().and_then(parse_iso8601),
            TimestampFormat::Unix => {
                let secs = json_as_i64(value)?;
                Utc.timestamp_opt(secs, 0).single()
            }
            TimestampFormat::UnixMs => {
                let millis = json_as_i64(value)?;
                Utc.timestamp_millis_opt(millis).single()
            }
        }
    }
}

fn json_as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts RFC 3339, naive datetimes (assumed UTC) and bare dates
fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN)))
}

// ============================================================================
// Backoff Type
// ============================================================================

/// Shape of the delay curve between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Constant delay between retries
    Constant,
    /// Linear increase in delay
    Linear,
    /// Exponential increase in delay
    #[default]
    Exponential,
}

impl BackoffType {
    /// Raw (uncapped, unjittered) delay for a zero-based attempt index
    pub fn delay(self, initial: Duration, attempt: u32) -> Duration {
        match self {
            BackoffType::Constant => initial,
            BackoffType::Linear => initial.saturating_mul(attempt.saturating_add(1)),
            BackoffType::Exponential => initial.saturating_mul(2u32.saturating_pow(attempt)),
        }
    }
}
