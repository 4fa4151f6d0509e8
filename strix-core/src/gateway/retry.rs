//! Retry classification and backoff for gateway requests
//!
//! Transient provider failures (5xx, rate limits, timeouts, connection
//! errors) are retried with exponential backoff inside the gateway; anything
//! else surfaces to the caller as a fatal error.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Classify an error message as retriable (transient) or not (permanent)
pub fn is_retriable_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();

    let transient_patterns = [
        // HTTP 5xx server errors
        "500",
        "502",
        "503",
        "504",
        "internal server error",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
        // Rate limiting
        "429",
        "rate limit",
        "too many requests",
        "quota exceeded",
        // Connection issues
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "connection failed",
        "network error",
        // Provider overload
        "overloaded",
        "capacity",
        "temporarily unavailable",
        "try again",
    ];

    transient_patterns
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Whether the error specifically signals rate limiting
pub fn is_rate_limit_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    ["429", "rate limit", "too many requests", "quota exceeded"]
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Build an exponential backoff strategy from configuration
pub fn build_backoff(config: &RetryConfig) -> ExponentialBuilder {
    let mut builder = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_max_times(config.max_retries);

    if config.jitter {
        builder = builder.with_jitter();
    }

    builder
}
