//! Reconnect backoff.
//!
//! The controller counts consecutive failed connection attempts. A
//! permanent error ends the session at once; a recoverable one earns
//! another attempt after an exponentially growing, jittered delay, until
//! the attempt limit is reached.

use crate::error::SyncError;
use rand::Rng;
use std::time::Duration;

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_factor: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt limit.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (1-based). Never exceeds
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let mut delay = base.min(max);
        if self.add_jitter && delay > 0.0 {
            delay += delay * 0.25 * rand::thread_rng().gen::<f64>();
            delay = delay.min(max);
        }
        Duration::from_secs_f64(delay)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry {
        /// Number of consecutive failures so far.
        attempt: u32,
        /// Time to wait.
        delay: Duration,
    },
    /// Stop; the error is terminal.
    GiveUp,
}

/// Tracks consecutive failures for one session.
#[derive(Debug, Clone)]
pub struct BackoffController {
    policy: RetryPolicy,
    failures: u32,
}

impl BackoffController {
    /// Creates a controller.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Records a failed attempt and decides whether to retry.
    pub fn on_failure(&mut self, error: &SyncError) -> RetryDecision {
        if !error.is_recoverable() {
            return RetryDecision::GiveUp;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            attempt: self.failures,
            delay: self.policy.delay_for_attempt(self.failures),
        }
    }

    /// Clears the failure count after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
