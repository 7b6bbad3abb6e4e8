//! Retry policy and per-attempt context.

use super::{BackoffStrategy, RetryCondition};
use crate::errors::StratusError;
use std::time::Duration;
use tracing::debug;

/// Snapshot handed to the retry policy after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    retries_attempted: u32,
    last_error: Option<StratusError>,
    last_status: Option<u16>,
    elapsed: Duration,
}

impl RetryContext {
    /// Creates a context. The status is taken from a status error.
    #[must_use]
    pub fn new(retries_attempted: u32, last_error: Option<StratusError>, elapsed: Duration) -> Self {
        let last_status = last_error.as_ref().and_then(StratusError::status_code);
        Self {
            retries_attempted,
            last_error,
            last_status,
            elapsed,
        }
    }

    /// Overrides the last status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.last_status = Some(status);
        self
    }

    /// Retries attempted so far.
    #[must_use]
    pub fn retries_attempted(&self) -> u32 {
        self.retries_attempted
    }

    /// The failure of the last attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&StratusError> {
        self.last_error.as_ref()
    }

    /// Status code of the last response, if one was received.
    #[must_use]
    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    /// Time since the logical request started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Outcome of consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the delay.
    Retry(Duration),
    /// The failure is retryable but the retry budget is spent.
    GiveUp,
    /// The failure is not retryable.
    NotRetryable,
}

/// Retry condition plus backoff plus retry budget.
///
/// The budget is always AND-ed with the condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    condition: RetryCondition,
    backoff: BackoffStrategy,
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryCondition::default(), BackoffStrategy::default(), 3)
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(condition: RetryCondition, backoff: BackoffStrategy, max_retries: u32) -> Self {
        Self {
            condition,
            backoff,
            max_retries,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(RetryCondition::Never, BackoffStrategy::none(), 0)
    }

    /// Sets the condition.
    #[must_use]
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Sets the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true if another attempt should be made.
    #[must_use]
    pub fn should_retry(&self, context: &RetryContext) -> bool {
        context.retries_attempted < self.max_retries && self.condition.should_retry(context)
    }

    /// Delay before the next attempt.
    #[must_use]
    pub fn next_delay(&self, context: &RetryContext) -> Duration {
        self.backoff.compute_delay(context.retries_attempted)
    }

    /// Returns true if the condition alone would retry, ignoring the budget.
    #[must_use]
    pub fn is_retryable(&self, context: &RetryContext) -> bool {
        self.condition.should_retry(context)
    }

    /// Combines the condition, the budget and the backoff into one decision.
    #[must_use]
    pub fn decide(&self, context: &RetryContext) -> RetryDecision {
        let decision = if !self.condition.should_retry(context) {
            RetryDecision::NotRetryable
        } else if context.retries_attempted >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.next_delay(context))
        };
        debug!(
            retries_attempted = context.retries_attempted,
            last_status = ?context.last_status,
            decision = ?decision,
            "Retry decision"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn reset() -> StratusError {
        StratusError::transmission("connection reset")
    }

    #[test]
    fn test_decide_retries_within_budget() {
        let policy = RetryPolicy::default().with_backoff(BackoffStrategy::fixed(Duration::from_millis(5)));
        let context = RetryContext::new(0, Some(reset()), Duration::ZERO);
        assert_eq!(policy.decide(&context), RetryDecision::Retry(Duration::from_millis(5)));
        assert!(policy.should_retry(&context));
    }

    #[test]
    fn test_decide_gives_up_after_budget() {
        let policy = RetryPolicy::default().with_max_retries(2);
        let context = RetryContext::new(2, Some(reset()), Duration::ZERO);
        assert_eq!(policy.decide(&context), RetryDecision::GiveUp);
        assert!(!policy.should_retry(&context));
        assert!(policy.is_retryable(&context));
    }

    #[test]
    fn test_decide_not_retryable() {
        let policy = RetryPolicy::default();
        let context = RetryContext::new(
            0,
            Some(StratusError::Status {
                code: 403,
                text: "Forbidden".into(),
            }),
            Duration::ZERO,
        );
        assert_eq!(context.last_status(), Some(403));
        assert_eq!(policy.decide(&context), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_max_attempts_anded_with_condition() {
        let policy = RetryPolicy::new(RetryCondition::Always, BackoffStrategy::none(), 1);
        assert!(policy.should_retry(&RetryContext::new(0, None, Duration::ZERO)));
        assert!(!policy.should_retry(&RetryContext::new(1, None, Duration::ZERO)));
    }

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::none();
        let context = RetryContext::new(0, Some(reset()), Duration::ZERO);
        assert_eq!(policy.decide(&context), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_status_override() {
        let policy = RetryPolicy::new(
            RetryCondition::status_codes(vec![500]).and(RetryCondition::error_kinds(vec![ErrorKind::ServiceStatus])),
            BackoffStrategy::none(),
            3,
        );
        let context = RetryContext::new(
            0,
            Some(StratusError::Status {
                code: 500,
                text: String::new(),
            }),
            Duration::from_millis(12),
        );
        assert!(policy.should_retry(&context));
        assert_eq!(context.elapsed(), Duration::from_millis(12));
        assert!(!policy.should_retry(&context.with_status(404)));
    }
}
