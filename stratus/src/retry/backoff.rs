//! Backoff delay computation.

use crate::errors::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Retry immediately.
    None,
    /// Always wait `base_delay`.
    Fixed,
    /// `exp/2 + rand[0, exp/2)`
    EqualJitter,
    /// `rand[0, exp)`
    #[default]
    FullJitter,
}

/// Computes the delay before the next attempt.
///
/// For the jittered kinds `exp = min(base_delay * 2^min(attempt, max_retries), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStrategy {
    kind: BackoffKind,
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::full_jitter(Duration::from_millis(100), Duration::from_secs(20), 30)
    }
}

impl BackoffStrategy {
    /// No delay between attempts.
    #[must_use]
    pub fn none() -> Self {
        Self {
            kind: BackoffKind::None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries: 0,
        }
    }

    /// Constant delay.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
            max_delay: delay,
            max_retries: 0,
        }
    }

    /// Full jitter over an exponential curve.
    #[must_use]
    pub fn full_jitter(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            kind: BackoffKind::FullJitter,
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// Equal jitter over an exponential curve.
    #[must_use]
    pub fn equal_jitter(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            kind: BackoffKind::EqualJitter,
            ..Self::full_jitter(base_delay, max_delay, max_retries)
        }
    }

    /// Builds a strategy from raw, possibly negative, configuration values.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first negative parameter.
    pub fn from_millis(
        kind: BackoffKind,
        base_delay_ms: i64,
        max_delay_ms: i64,
        max_retries: i64,
    ) -> Result<Self, ConfigError> {
        let base = non_negative("base_delay_ms", base_delay_ms)?;
        let max = non_negative("max_delay_ms", max_delay_ms)?;
        let retries = u32::try_from(non_negative("max_retries", max_retries)?)
            .map_err(|_| ConfigError::new("max_retries", "too large"))?;
        Ok(Self {
            kind,
            base_delay: Duration::from_millis(base),
            max_delay: Duration::from_millis(max),
            max_retries: retries,
        })
    }

    /// The kind of curve.
    #[must_use]
    pub fn kind(&self) -> BackoffKind {
        self.kind
    }

    /// Delay before the attempt following `retries_attempted` retries.
    #[must_use]
    pub fn compute_delay(&self, retries_attempted: u32) -> Duration {
        self.compute_delay_with(retries_attempted, &mut rand::thread_rng())
    }

    /// Like [`compute_delay`](Self::compute_delay) with a caller-supplied RNG.
    pub fn compute_delay_with<R: Rng + ?Sized>(&self, retries_attempted: u32, rng: &mut R) -> Duration {
        let millis = match self.kind {
            BackoffKind::None => 0,
            BackoffKind::Fixed => duration_millis(self.base_delay),
            BackoffKind::FullJitter => {
                let exp = self.exponential_millis(retries_attempted);
                if exp == 0 {
                    0
                } else {
                    rng.gen_range(0..exp)
                }
            }
            BackoffKind::EqualJitter => {
                let exp = self.exponential_millis(retries_attempted);
                let half = exp / 2;
                if half == 0 {
                    half
                } else {
                    half + rng.gen_range(0..half)
                }
            }
        };
        Duration::from_millis(millis)
    }

    fn exponential_millis(&self, retries_attempted: u32) -> u64 {
        let shift = retries_attempted.min(self.max_retries).min(62);
        duration_millis(self.base_delay)
            .saturating_mul(1u64 << shift)
            .min(duration_millis(self.max_delay))
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::negative(field))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(10);

    #[test]
    fn test_full_jitter_bounds() {
        let backoff = BackoffStrategy::full_jitter(BASE, MAX, 30);
        for _ in 0..1000 {
            let delay = backoff.compute_delay(2);
            assert!(delay < Duration::from_millis(400), "{delay:?}");
        }
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let backoff = BackoffStrategy::equal_jitter(BASE, MAX, 30);
        for _ in 0..1000 {
            let delay = backoff.compute_delay(2);
            assert!(delay >= Duration::from_millis(200), "{delay:?}");
            assert!(delay < Duration::from_millis(400), "{delay:?}");
        }
    }

    #[test]
    fn test_exponent_capped_by_max_retries_and_max_delay() {
        let backoff = BackoffStrategy::equal_jitter(BASE, MAX, 3);
        for _ in 0..100 {
            let delay = backoff.compute_delay(10);
            assert!(delay >= Duration::from_millis(400) && delay < Duration::from_millis(800));
        }

        let capped = BackoffStrategy::equal_jitter(BASE, Duration::from_millis(300), 30);
        for _ in 0..100 {
            assert!(capped.compute_delay(5) < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_fixed_and_none() {
        assert_eq!(
            BackoffStrategy::fixed(Duration::from_millis(50)).compute_delay(7),
            Duration::from_millis(50)
        );
        assert_eq!(BackoffStrategy::none().compute_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_zero_base_never_panics() {
        let backoff = BackoffStrategy::full_jitter(Duration::ZERO, MAX, 3);
        assert_eq!(backoff.compute_delay(1), Duration::ZERO);
        let backoff = BackoffStrategy::equal_jitter(Duration::from_millis(1), MAX, 0);
        assert_eq!(backoff.compute_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_negative_parameters_rejected() {
        let err = BackoffStrategy::from_millis(BackoffKind::FullJitter, -1, 100, 3).unwrap_err();
        assert_eq!(err.field, "base_delay_ms");
        let err = BackoffStrategy::from_millis(BackoffKind::FullJitter, 1, 100, -3).unwrap_err();
        assert_eq!(err.field, "max_retries");
        assert!(BackoffStrategy::from_millis(BackoffKind::Fixed, 0, 0, 0).is_ok());
    }
}
