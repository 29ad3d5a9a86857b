//! Failure classification and exponential backoff.

use std::time::Duration;

use common::config::RetryConfig;
use rand::Rng;

use crate::store::StoreError;

/// How a store failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts and transient service errors: retry with backoff.
    Retryable,
    /// The request was too large: split the path into its children.
    Structural,
    /// Permission, missing or malformed paths: give up on the whole subtree.
    Fatal,
}

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    FanOut,
    GiveUp,
}

/// Exponential backoff with jitter, bounded by an attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay.max(config.base_delay),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Randomize each delay by up to `jitter` of its value in either direction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn classify(error: &StoreError) -> FailureClass {
        match error {
            StoreError::Timeout(_) | StoreError::Transient(_) => FailureClass::Retryable,
            StoreError::PayloadTooLarge(_) => FailureClass::Structural,
            StoreError::PermissionDenied(_)
            | StoreError::NotFound(_)
            | StoreError::MalformedPath(_) => FailureClass::Fatal,
        }
    }

    /// Decide how to continue after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, error: &StoreError, attempt: u32) -> RetryDecision {
        match Self::classify(error) {
            FailureClass::Structural => RetryDecision::FanOut,
            FailureClass::Fatal => RetryDecision::GiveUp,
            FailureClass::Retryable if attempt < self.max_attempts => {
                RetryDecision::RetryAfter(self.backoff(attempt))
            }
            FailureClass::Retryable => RetryDecision::GiveUp,
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_backoff(attempt);
        if self.jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor).min(self.max_delay)
    }

    /// Backoff before jitter: `base_delay * multiplier^(attempt - 1)`, capped.
    pub fn nominal_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }
}
