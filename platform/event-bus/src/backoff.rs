//! Exponential backoff
//!
//! Used by the pull consumer between broker connection attempts and to space
//! out redeliveries of failed messages. The reconnect budget is finite: once
//! it is spent, [`ReconnectBackoff::next_delay`] returns `None` and the caller
//! is expected to give up.

use std::time::Duration;

/// Configuration for reconnect behavior
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt (doubles on each attempt)
    pub base_delay: Duration,
    /// Maximum delay to cap exponential growth
    pub max_delay: Duration,
    /// Maximum number of reconnect attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    /// `base * 2^(attempt-1)` capped at `max_delay`; attempt 0 means no delay
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // 2^31 * base overflows long before it matters; saturate instead
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base_delay.checked_mul(factor).unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Stateful attempt counter producing `base * 2^(attempt-1)` delays
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Advance to the next attempt and return its delay.
    ///
    /// Returns `None` when `max_attempts` have already been scheduled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.config.delay_for(self.attempt))
    }

    /// Number of attempts scheduled since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Called after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
