//! Composable retry conditions.

use super::RetryContext;
use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize};

/// Status codes retried by default.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// A predicate over a [`RetryContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryCondition {
    /// Never retry.
    Never,
    /// Always retry.
    Always,
    /// True while fewer than `max_retries` retries were attempted.
    MaxAttempts {
        /// Retry budget.
        max_retries: u32,
    },
    /// True if the last failure has one of the kinds.
    ErrorKinds {
        /// Matching kinds.
        kinds: Vec<ErrorKind>,
    },
    /// True if the last response status is one of the codes.
    StatusCodes {
        /// Matching codes.
        codes: Vec<u16>,
    },
    /// All children hold.
    And {
        /// Children.
        conditions: Vec<RetryCondition>,
    },
    /// Any child holds.
    Or {
        /// Children.
        conditions: Vec<RetryCondition>,
    },
    /// The child does not hold.
    Not {
        /// Child.
        condition: Box<RetryCondition>,
    },
}

impl Default for RetryCondition {
    /// Transient transport failures or a retryable status.
    fn default() -> Self {
        Self::error_kinds(ErrorKind::transient().to_vec()).or(Self::status_codes(RETRYABLE_STATUS_CODES.to_vec()))
    }
}

impl RetryCondition {
    /// Matches failures of the given kinds.
    #[must_use]
    pub fn error_kinds(kinds: Vec<ErrorKind>) -> Self {
        Self::ErrorKinds { kinds }
    }

    /// Matches responses with the given status codes.
    #[must_use]
    pub fn status_codes(codes: Vec<u16>) -> Self {
        Self::StatusCodes { codes }
    }

    /// Caps the number of retries.
    #[must_use]
    pub fn max_attempts(max_retries: u32) -> Self {
        Self::MaxAttempts { max_retries }
    }

    /// Conjunction.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And { mut conditions } => {
                conditions.push(other);
                Self::And { conditions }
            }
            first => Self::And {
                conditions: vec![first, other],
            },
        }
    }

    /// Disjunction.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match self {
            Self::Or { mut conditions } => {
                conditions.push(other);
                Self::Or { conditions }
            }
            first => Self::Or {
                conditions: vec![first, other],
            },
        }
    }

    /// Negation.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not {
            condition: Box::new(self),
        }
    }

    /// Evaluates the condition.
    #[must_use]
    pub fn should_retry(&self, context: &RetryContext) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::MaxAttempts { max_retries } => context.retries_attempted() < *max_retries,
            Self::ErrorKinds { kinds } => context
                .last_error()
                .is_some_and(|error| kinds.contains(&error.kind())),
            Self::StatusCodes { codes } => context.last_status().is_some_and(|code| codes.contains(&code)),
            Self::And { conditions } => conditions.iter().all(|c| c.should_retry(context)),
            Self::Or { conditions } => conditions.iter().any(|c| c.should_retry(context)),
            Self::Not { condition } => !condition.should_retry(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StratusError;
    use std::time::Duration;

    fn context(retries: u32, error: StratusError) -> RetryContext {
        RetryContext::new(retries, Some(error), Duration::ZERO)
    }

    fn status(code: u16) -> StratusError {
        StratusError::Status {
            code,
            text: String::new(),
        }
    }

    #[test]
    fn test_default_condition() {
        let condition = RetryCondition::default();
        assert!(condition.should_retry(&context(0, StratusError::transmission("reset"))));
        assert!(condition.should_retry(&context(0, status(503))));
        assert!(!condition.should_retry(&context(0, status(404))));
        assert!(!condition.should_retry(&context(0, StratusError::Cancelled("x".into()))));
    }

    #[test]
    fn test_composition() {
        let condition = RetryCondition::status_codes(vec![500])
            .or(RetryCondition::error_kinds(vec![ErrorKind::Timeout]))
            .and(RetryCondition::max_attempts(2));

        assert!(condition.should_retry(&context(1, status(500))));
        assert!(!condition.should_retry(&context(2, status(500))));

        let negated = RetryCondition::status_codes(vec![404]).not();
        assert!(negated.should_retry(&context(0, status(500))));
        assert!(!negated.should_retry(&context(0, status(404))));
    }

    #[test]
    fn test_serde_shape() {
        let condition: RetryCondition = serde_json::from_str(
            r#"{"type": "or", "conditions": [
                {"type": "status_codes", "codes": [503]},
                {"type": "error_kinds", "kinds": ["timeout"]}
            ]}"#,
        )
        .unwrap();
        assert!(condition.should_retry(&context(0, status(503))));
        assert!(condition.should_retry(&context(
            0,
            StratusError::SocketTimeout {
                millis: 10,
                during: "reading".into()
            }
        )));
    }
}
