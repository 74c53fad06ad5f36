//! Pure reconnection decision logic
//!
//! Backoff grows exponentially per consecutive failed attempt and is capped.
//! Nothing here sleeps or touches the network.

use crate::config::ReconnectSection;
use std::time::Duration;

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `attempt` is the 1-based retry number
    Proceed { attempt: u32, delay: Duration },
    /// Retries are exhausted
    Exhausted,
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failed attempt (None = unlimited)
    pub max_retries: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for RetryPolicy {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_retries: section.max_retries,
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, capped at `max_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Decide what to do after `consecutive_failures` failed attempts in a row
    pub fn decide(&self, consecutive_failures: u32) -> RetryDecision {
        if let Some(max_retries) = self.max_retries {
            if consecutive_failures > max_retries {
                return RetryDecision::Exhausted;
            }
        }

        RetryDecision::Proceed {
            attempt: consecutive_failures,
            delay: self.backoff(consecutive_failures),
        }
    }
}
