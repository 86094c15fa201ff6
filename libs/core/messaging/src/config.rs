//! Retry configuration shared by every work consumer.

use crate::error::ProcessingError;
use std::time::Duration;

/// Retry policy applied to retryable processing failures.
///
/// The number of attempts is bounded by the stream consumer's `max_deliver`;
/// this policy only decides how long the broker waits before redelivering.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff for transient failures
    pub backoff: BackoffStrategy,

    /// Backoff for rate limited failures without a retry-after hint
    pub rate_limit_backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            rate_limit_backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(5),
                max: Duration::from_secs(120),
            },
        }
    }
}

impl RetryPolicy {
    /// A policy that asks for immediate redelivery (useful in tests).
    pub fn immediate() -> Self {
        Self {
            backoff: BackoffStrategy::Fixed(Duration::ZERO),
            rate_limit_backoff: BackoffStrategy::Fixed(Duration::ZERO),
        }
    }

    /// Redelivery delay after `attempt` failed deliveries (1-based).
    pub fn delay_for(&self, error: &ProcessingError, attempt: u32) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint;
        }
        let retry_count = attempt.saturating_sub(1);
        match error.category() {
            crate::ErrorCategory::RateLimited => self.rate_limit_backoff.delay(retry_count),
            _ => self.backoff.delay(retry_count),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential backoff (base * 2^retry_count, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (retry_count + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(retry_count));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry_count.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}
