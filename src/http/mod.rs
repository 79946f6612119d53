//! Sales API access
//!
//! Provides the page source abstraction the engine pulls from and its HTTP
//! implementation.
//!
//! # Features
//!
//! - **Failure Classification**: every failed call is tagged rate-limited,
//!   transient or fatal for the retry policy
//! - **Rate Limiting**: optional token bucket throttle using governor
//! - **Response Decoding**: records and next cursor via the decode module

mod client;
mod rate_limit;
mod source;

pub use client::{ApiConfig, SalesApiClient};
pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use source::{FetchError, FetchResult, PageResult, PageSource};
