//! Response decoder module
//!
//! Turns a sales API page body into typed records and the next cursor.
//!
//! # Overview
//!
//! Records are located by a configurable path (dot notation, or JSONPath
//! when wildcards are involved). Each record must carry a parseable business
//! timestamp; a record without one is a decode error, since early-exit
//! decisions depend on it.

mod decoder;
mod types;

pub use decoder::PageDecoder;
pub use types::{DecodedPage, DecoderConfig, ExtractedRecord};
