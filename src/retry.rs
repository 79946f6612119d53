//! Retry and backoff policy
//!
//! The policy only advises: given how a page fetch failed and how many times
//! in a row it has failed that way, it returns how long to wait or that the
//! run should give up. The engine owns the loop and the sleeping.

use crate::types::BackoffType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Failure Classification
// ============================================================================

/// How a page fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429, optionally with a server-provided wait
    RateLimited {
        /// Parsed `Retry-After` header
        retry_after: Option<Duration>,
    },
    /// Timeouts, connection resets, 5xx and 408
    Transient,
    /// Anything retrying cannot fix
    Fatal,
}

impl FailureKind {
    /// Short label used in logs and retry events
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimited { .. } => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }

    /// Whether this failure counts against the transient retry cap
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the engine should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Sleep for the given duration, then try the same page again
    Retry(Duration),
    /// Stop the run
    GiveUp,
}

// ============================================================================
// Configuration
// ============================================================================

/// Retry tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Transient failures tolerated in a row before giving up
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    /// Shape of the transient backoff curve
    #[serde(default)]
    pub backoff_type: BackoffType,

    /// First transient delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on a transient delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Base delay for 429s without `Retry-After`, in milliseconds
    #[serde(default = "default_rate_limit_base_ms")]
    pub rate_limit_base_ms: u64,

    /// Upper bound on a rate-limit wait in milliseconds
    #[serde(default = "default_rate_limit_max_ms")]
    pub rate_limit_max_ms: u64,

    /// Randomize transient delays within `[delay / 2, delay]`
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_max_transient_retries(),
            backoff_type: BackoffType::Exponential,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            rate_limit_base_ms: default_rate_limit_base_ms(),
            rate_limit_max_ms: default_rate_limit_max_ms(),
            jitter: default_true(),
        }
    }
}

fn default_max_transient_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_rate_limit_base_ms() -> u64 {
    5000
}

fn default_rate_limit_max_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Policy
// ============================================================================

/// Decides between waiting and giving up
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from its configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what to do about the `attempt`-th consecutive failure of `failure`'s kind.
    ///
    /// `attempt` is 1-based. Rate limits are retried without bound; the
    /// API-call ceiling is what eventually stops a storm.
    pub fn next_action(&self, failure: FailureKind, attempt: u32) -> RetryAction {
        let attempt = attempt.max(1);
        match failure {
            FailureKind::RateLimited { retry_after } => {
                let wait = retry_after.unwrap_or_else(|| self.rate_limit_backoff(attempt));
                RetryAction::Retry(wait)
            }
            FailureKind::Transient if attempt <= self.config.max_transient_retries => {
                let delay = self.transient_backoff(attempt);
                if self.config.jitter {
                    RetryAction::Retry(jitter(delay))
                } else {
                    RetryAction::Retry(delay)
                }
            }
            FailureKind::Transient | FailureKind::Fatal => RetryAction::GiveUp,
        }
    }

    /// Capped, unjittered transient delay for a 1-based attempt
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        let delay = self.config.backoff_type.delay(
            Duration::from_millis(self.config.initial_backoff_ms),
            attempt.saturating_sub(1),
        );
        delay.min(Duration::from_millis(self.config.max_backoff_ms))
    }

    /// Capped rate-limit delay used when the server gives no hint
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        let delay = BackoffType::Exponential.delay(
            Duration::from_millis(self.config.rate_limit_base_ms),
            attempt.saturating_sub(1),
        );
        delay.min(Duration::from_millis(self.config.rate_limit_max_ms))
    }
}

/// Pick a delay uniformly from `[delay / 2, delay]`
fn jitter(delay: Duration) -> Duration {
    let half = delay / 2;
    if half.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(Duration::ZERO..=half);
    half + extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_transient_retries, 5);
        assert_eq!(config.backoff_type, BackoffType::Exponential);
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_partial_yaml() {
        let config: RetryConfig = serde_yaml::from_str("max_transient_retries: 2\njitter: false").unwrap();
        assert_eq!(config.max_transient_retries, 2);
        assert!(!config.jitter);
        assert_eq!(config.initial_backoff_ms, 1000);
    }

    #[test_case(1, 1000 ; "first attempt uses the initial delay")]
    #[test_case(2, 2000 ; "second attempt doubles")]
    #[test_case(4, 8000 ; "fourth attempt")]
    #[test_case(10, 60_000 ; "capped at max backoff")]
    fn test_transient_backoff(attempt: u32, expected_ms: u64) {
        assert_eq!(
            no_jitter().next_action(FailureKind::Transient, attempt),
            RetryAction::Retry(Duration::from_millis(expected_ms))
        );
    }

    #[test]
    fn test_transient_cap() {
        let policy = no_jitter();
        for attempt in 1..=5 {
            assert!(matches!(
                policy.next_action(FailureKind::Transient, attempt),
                RetryAction::Retry(_)
            ));
        }
        assert_eq!(
            policy.next_action(FailureKind::Transient, 6),
            RetryAction::GiveUp
        );
    }

    #[test]
    fn test_zero_transient_retries_gives_up_immediately() {
        let policy = RetryPolicy::new(RetryConfig {
            max_transient_retries: 0,
            ..RetryConfig::default()
        });
        assert_eq!(
            policy.next_action(FailureKind::Transient, 1),
            RetryAction::GiveUp
        );
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let full = policy.transient_backoff(attempt);
            let RetryAction::Retry(wait) = policy.next_action(FailureKind::Transient, attempt)
            else {
                panic!("expected a retry at attempt {attempt}");
            };
            assert!(wait >= full / 2 && wait <= full, "{wait:?} vs {full:?}");
        }
    }

    #[test_case(Some(5), 1, 5_000 ; "server hint wins")]
    #[test_case(Some(5), 40, 5_000 ; "server hint wins on late attempts")]
    #[test_case(None, 1, 5_000 ; "base delay")]
    #[test_case(None, 3, 20_000 ; "doubles per attempt")]
    #[test_case(None, 30, 300_000 ; "capped at max wait")]
    fn test_rate_limit_wait(retry_after: Option<u64>, attempt: u32, expected_ms: u64) {
        let failure = FailureKind::RateLimited {
            retry_after: retry_after.map(Duration::from_secs),
        };
        assert_eq!(
            RetryPolicy::default().next_action(failure, attempt),
            RetryAction::Retry(Duration::from_millis(expected_ms))
        );
    }

    #[test]
    fn test_rate_limit_never_gives_up() {
        let policy = RetryPolicy::default();
        let failure = FailureKind::RateLimited { retry_after: None };
        assert!(matches!(
            policy.next_action(failure, 10_000),
            RetryAction::Retry(_)
        ));
    }

    #[test]
    fn test_fatal_gives_up() {
        assert_eq!(
            RetryPolicy::default().next_action(FailureKind::Fatal, 1),
            RetryAction::GiveUp
        );
    }

    #[test]
    fn test_failure_labels() {
        assert_eq!(FailureKind::Transient.to_string(), "transient");
        assert_eq!(
            FailureKind::RateLimited { retry_after: None }.label(),
            "rate_limited"
        );
        assert!(FailureKind::Transient.is_transient());
        assert!(!FailureKind::Fatal.is_transient());
    }
}
