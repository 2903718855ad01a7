//! Retry policies for failed account registrations and orders.
//!
//! ## Example
//!
//! ```rust
//! use certpilot_acme::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::bounded(5, BackoffStrategy::exponential(Duration::from_secs(10)));
//! assert!(policy.allows_retry(4));
//! assert!(!policy.allows_retry(5));
//! ```

use std::time::Duration;

/// Backoff strategy for retries.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Constant delay between retries.
    Constant(Duration),
    /// Linear backoff: delay increases by a fixed amount.
    Linear {
        /// Initial delay.
        initial: Duration,
        /// Increment per retry.
        increment: Duration,
        /// Maximum delay.
        max: Duration,
    },
    /// Exponential backoff: delay is multiplied each retry.
    Exponential {
        /// Initial delay.
        initial: Duration,
        /// Multiplier (typically 2.0).
        multiplier: f64,
        /// Maximum delay.
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Create constant backoff.
    pub fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    /// Create linear backoff.
    pub fn linear(initial: Duration, increment: Duration) -> Self {
        Self::Linear {
            initial,
            increment,
            max: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Create exponential backoff.
    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Set maximum delay.
    pub fn with_max(self, max: Duration) -> Self {
        match self {
            Self::Linear { initial, increment, .. } => Self::Linear { initial, increment, max },
            Self::Exponential { initial, multiplier, .. } => {
                Self::Exponential { initial, multiplier, max }
            }
            other => other,
        }
    }

    /// Calculate delay for a given retry (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear { initial, increment, max } => {
                let delay = initial.saturating_add(increment.saturating_mul(attempt));
                delay.min(*max)
            }
            Self::Exponential { initial, multiplier, max } => {
                let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                let secs = initial.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// How often, and how far apart, a failed step is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum consecutive failures before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay before each retry
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// Retry forever with `backoff`
    pub fn unbounded(backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }

    /// Give up after `max_attempts` consecutive failures
    pub fn bounded(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures < max)
    }

    /// Delay before the retry that follows the `failures`-th failure (1-indexed)
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.backoff.delay_for_attempt(failures.saturating_sub(1))
    }
}
