//! Per-endpoint pool counters.

use serde::Serialize;

/// Snapshot of one endpoint's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently leased.
    pub leased: usize,
    /// Connections idle and ready for reuse.
    pub idle: usize,
    /// Acquisitions waiting for a slot.
    pub pending: usize,
    /// Connections established.
    pub created: u64,
    /// Leases satisfied by an idle connection.
    pub reused: u64,
    /// Connections returned to the idle set.
    pub released: u64,
    /// Connections closed at release because they could not be reused.
    pub closed: u64,
    /// Connections forcibly disconnected.
    pub discarded: u64,
}

impl PoolStats {
    /// Converts the snapshot to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
