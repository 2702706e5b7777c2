//! Retry and fallback decisions
//!
//! After every plugin call the pool asks [`RetryPolicy::decide`] what to
//! do next. The decision depends only on the outcome and the message's
//! per-channel accounting, so it is tested without any I/O.

use iris_core::{DeliveryOutcome, Message, RetryConfig};
use std::time::Duration;

/// What to do after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Delivered; stop
    Delivered,
    /// Try the same channel again after the delay
    Retry {
        /// Backoff delay
        delay: Duration,
    },
    /// Move to the next contact in the chain
    Fallback,
    /// No channel left; the target failed
    Exhausted,
}

/// Retry limits and backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_transient_attempts: u32,
    max_unknown_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_transient_attempts: config.max_transient_attempts.max(1),
            max_unknown_attempts: config.max_unknown_attempts.max(1),
        }
    }

    /// Backoff before retry number `attempt` (1-based), capped
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decide the next step for a message whose attempt counters already
    /// include the attempt that produced `outcome`
    #[must_use]
    pub fn decide(&self, message: &Message, outcome: DeliveryOutcome) -> Decision {
        let limit = match outcome {
            DeliveryOutcome::Success => return Decision::Delivered,
            DeliveryOutcome::PermanentFailure => return self.next_channel(message),
            DeliveryOutcome::TransientFailure => self.max_transient_attempts,
            DeliveryOutcome::Unknown => self.max_unknown_attempts,
        };
        if message.channel_attempts < limit {
            Decision::Retry {
                delay: self.backoff(message.channel_attempts),
            }
        } else {
            self.next_channel(message)
        }
    }

    fn next_channel(&self, message: &Message) -> Decision {
        if message.has_fallback() {
            Decision::Fallback
        } else {
            Decision::Exhausted
        }
    }
}
