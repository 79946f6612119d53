//! Page source abstraction
//!
//! The engine talks to the sales API through [`PageSource`]; the HTTP client
//! is one implementation, tests script others.

use crate::decode::ExtractedRecord;
use crate::error::Error;
use crate::retry::FailureKind;
use crate::types::Cursor;
use async_trait::async_trait;
use std::time::Duration;

/// One page of the record stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResult {
    /// Records in API order
    pub records: Vec<ExtractedRecord>,
    /// Cursor to request the following page with
    pub next_cursor: Option<Cursor>,
    /// No records came back; the stream is exhausted
    pub empty: bool,
}

impl PageResult {
    /// Build a page, deriving `empty` from the records
    pub fn new(records: Vec<ExtractedRecord>, next_cursor: Option<Cursor>) -> Self {
        let empty = records.is_empty();
        Self {
            records,
            next_cursor,
            empty,
        }
    }

    /// Terminal page
    pub fn exhausted() -> Self {
        Self::new(Vec::new(), None)
    }
}

/// A failed page fetch, classified for the retry policy
#[derive(Debug, thiserror::Error)]
#[error("{kind} failure: {source}")]
pub struct FetchError {
    /// How the retry policy should treat it
    pub kind: FailureKind,
    /// Underlying error
    #[source]
    pub source: Error,
}

impl FetchError {
    /// Wrap an error with an explicit classification
    pub fn new(kind: FailureKind, source: Error) -> Self {
        Self { kind, source }
    }

    /// Classify an error by its retryability
    pub fn classify(source: Error) -> Self {
        let kind = match &source {
            Error::RateLimited {
                retry_after_seconds,
            } => FailureKind::RateLimited {
                retry_after: retry_after_seconds.map(Duration::from_secs),
            },
            e if e.is_retryable() => FailureKind::Transient,
            _ => FailureKind::Fatal,
        };
        Self { kind, source }
    }

    /// 429 with an optional server hint
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited { retry_after },
            source: Error::RateLimited {
                retry_after_seconds: retry_after.map(|d| d.as_secs()),
            },
        }
    }

    /// Retryable failure with a message
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, Error::Other(message.into()))
    }

    /// Non-retryable failure with a message
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, Error::Other(message.into()))
    }
}

/// Result of a single page fetch
pub type FetchResult = std::result::Result<PageResult, FetchError>;

/// Anything that can serve pages of the sales stream.
///
/// Implementations make exactly one upstream call per invocation and never
/// retry on their own.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch the page starting at `cursor` (`None` = start of stream)
    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: u32) -> FetchResult;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for std::sync::Arc<T> {
    async fn fetch_page(&self, cursor: Option<&Cursor>, page_size: u32) -> FetchResult {
        (**self).fetch_page(cursor, page_size).await
    }
}
