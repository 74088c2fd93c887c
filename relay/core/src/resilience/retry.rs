//! Retry Policy
//!
//! Exponential backoff with bounded jitter, and a per-candidate attempt
//! state machine. The dispatcher asks [`RetryState::next`] what to do after
//! every failed attempt instead of nesting the retry loop in callbacks.

use std::time::Duration;

use rand::Rng;

use super::classifier::{ErrorCategory, ErrorRecord};

/// Backoff and budget settings
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries allowed on one candidate after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Cap applied before jitter
    pub max_delay: Duration,

    /// Jitter upper bound as a fraction of the delay
    pub jitter_factor: f64,

    /// Delay for rate-limit responses without a hint
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.1,
            rate_limit_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, handy when delays must be exact
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// `min(base * 2^attempt, max)` for a 0-indexed retry
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Add jitter in `[0, jitter_factor * delay]`
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let max_jitter = delay.as_secs_f64() * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(0.0..=max_jitter);
        delay + Duration::from_secs_f64(jitter)
    }

    /// Delay before retry number `attempt` (0-indexed) after `record`
    pub fn delay_for(&self, attempt: u32, record: &ErrorRecord) -> Duration {
        match record.category {
            ErrorCategory::RateLimit => record.retry_after.unwrap_or(self.rate_limit_delay),
            _ => self.with_jitter(self.backoff_for_attempt(attempt)),
        }
    }

    /// Fresh attempt state for one candidate
    pub fn start(&self, max_retries: u32) -> RetryState {
        RetryState {
            policy: self.clone(),
            max_retries,
            retries: 0,
            unknown_retried: false,
            credentials_refreshed: false,
        }
    }
}

/// What to do after a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try the same candidate again
    RetryAfter(Duration),
    /// Refresh credentials, then try the same candidate again
    RefreshCredentials,
    /// Give up on this candidate and move to the next one
    Failover,
    /// Give up on the whole invocation
    Abort,
}

/// Attempt bookkeeping for one candidate
#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    max_retries: u32,
    retries: u32,
    unknown_retried: bool,
    credentials_refreshed: bool,
}

impl RetryState {
    /// Retries granted so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempt number of the next call, starting at 1
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Decide what follows the failure described by `record`
    pub fn next(&mut self, record: &ErrorRecord) -> RetryDecision {
        if record.category == ErrorCategory::Validation {
            return RetryDecision::Abort;
        }
        if !record.retryable || self.retries >= self.max_retries {
            return RetryDecision::Failover;
        }

        match record.category {
            ErrorCategory::Auth => {
                if self.credentials_refreshed {
                    return RetryDecision::Failover;
                }
                self.credentials_refreshed = true;
                self.retries += 1;
                RetryDecision::RefreshCredentials
            }
            ErrorCategory::Unknown if self.unknown_retried => RetryDecision::Failover,
            category => {
                if category == ErrorCategory::Unknown {
                    self.unknown_retried = true;
                }
                let delay = self.policy.delay_for(self.retries, record);
                self.retries += 1;
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}
