//! Retry controller.
//!
//! Consulted after a failed attempt has released its connection and before
//! the next acquisition. Performs no I/O.

mod backoff;
mod condition;
mod policy;

pub use backoff::{BackoffKind, BackoffStrategy};
pub use condition::{RetryCondition, RETRYABLE_STATUS_CODES};
pub use policy::{RetryContext, RetryDecision, RetryPolicy};
