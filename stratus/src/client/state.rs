//! Execution states.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Where a request execution currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Waiting for a pooled connection.
    AcquiringConnection,
    /// Writing the request.
    Transmitting,
    /// Waiting for the response head.
    AwaitingResponse,
    /// Streaming the response body to the handler.
    StreamingBody,
    /// Waiting out a backoff delay before the next attempt.
    Retrying,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

impl ExecutionState {
    /// Returns true for `Complete` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::AcquiringConnection
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcquiringConnection => write!(f, "acquiring_connection"),
            Self::Transmitting => write!(f, "transmitting"),
            Self::AwaitingResponse => write!(f, "awaiting_response"),
            Self::StreamingBody => write!(f, "streaming_body"),
            Self::Retrying => write!(f, "retrying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Shared, observable state of one execution.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateCell(Arc<Mutex<ExecutionState>>);

impl StateCell {
    pub(crate) fn get(&self) -> ExecutionState {
        *self.0.lock()
    }

    /// Moves to `next`. Terminal states are final.
    pub(crate) fn set(&self, next: ExecutionState) {
        let mut state = self.0.lock();
        if state.is_terminal() || *state == next {
            return;
        }
        debug!(from = %*state, to = %next, "Execution state transition");
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_state_is_final() {
        let cell = StateCell::default();
        cell.set(ExecutionState::Transmitting);
        cell.set(ExecutionState::Failed);
        cell.set(ExecutionState::Retrying);
        assert_eq!(cell.get(), ExecutionState::Failed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ExecutionState::StreamingBody.to_string(), "streaming_body");
        assert!(ExecutionState::Complete.is_terminal());
        assert!(!ExecutionState::Retrying.is_terminal());
    }
}
