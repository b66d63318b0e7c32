//! Node retry with exponential backoff
//!
//! A node's `retry` block re-invokes a failed implementation before the step
//! is recorded as `error`. Delays grow as `base_delay * 2^retry_count`,
//! capped at `max_delay`.
//!
//! # Example
//!
//! ```
//! use kbflow::retry::{RetryConfig, RetryState};
//! use std::time::Duration;
//!
//! let config = RetryConfig::new(2, Duration::from_millis(100), Duration::from_secs(1));
//! let mut state = RetryState::new();
//!
//! assert!(state.should_retry(&config));
//! assert_eq!(state.calculate_delay(&config), Duration::from_millis(100));
//! state.record_retry();
//! assert_eq!(state.calculate_delay(&config), Duration::from_millis(200));
//! ```

use crate::error::NodeError;
use crate::models::RetryPolicy;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration for a node
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Maximum number of retry attempts (not including initial)
    /// * `base_delay` - Base delay for exponential backoff
    /// * `max_delay` - Maximum delay cap
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl From<&RetryPolicy> for RetryConfig {
    fn from(policy: &RetryPolicy) -> Self {
        Self::new(
            policy.max_retries,
            Duration::from_millis(policy.base_delay),
            Duration::from_millis(policy.max_delay),
        )
    }
}

/// Retry progress for one step
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1 for first attempt)
    pub attempt: u32,
    /// Number of retries performed (0 for first attempt)
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.retry_count < config.max_retries
    }

    /// Backoff before the next attempt
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let base_ms = config.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let exponential_ms = base_ms.saturating_mul(2u64.saturating_pow(self.retry_count));
        let max_ms = config.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let capped_ms = exponential_ms.min(max_ms);

        debug!(
            "Calculated backoff delay: {}ms (attempt {}, retry {})",
            capped_ms, self.attempt, self.retry_count
        );

        Duration::from_millis(capped_ms)
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;
    }

    /// Decide what follows a failed attempt. `Some(delay)` means sleep and
    /// try again; the retry is already recorded.
    pub fn on_failure(&mut self, config: &RetryConfig, error: &NodeError) -> Option<Duration> {
        if !is_retryable(error) || !self.should_retry(config) {
            return None;
        }

        let delay = self.calculate_delay(config);
        warn!(
            "{} (retrying in {:?}, attempt {}/{})",
            error,
            delay,
            self.attempt + 1,
            config.max_retries + 1
        );
        self.record_retry();
        Some(delay)
    }
}

/// Implementation failures and timeouts are transient. Cancellation and
/// problems with the definition itself are not.
pub fn is_retryable(error: &NodeError) -> bool {
    matches!(error, NodeError::Failed { .. } | NodeError::Timeout { .. })
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}
