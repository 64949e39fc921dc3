use serde::{Deserialize, Serialize};

/// Snapshot of one queue's depth, by bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Waiting to be received.
    pub ready: usize,
    /// Leased out, lock not yet expired.
    pub inflight: usize,
    /// Abandoned, waiting out the redelivery backoff.
    pub scheduled: usize,
    /// Parked after exhausting delivery attempts or a permanent failure.
    pub dead_lettered: usize,
}

impl QueueCounts {
    /// Messages still owed an outcome (everything except dead letters).
    pub fn outstanding(&self) -> usize {
        self.ready + self.inflight + self.scheduled
    }
}
