use crate::upstream::ClusterStats;

/// Guards against the stats connection backing up.
///
/// The guard trips whenever the bytes queued for transmit across the cluster exceed the ceiling. There is no
/// hysteresis: it keeps tripping on every check until the queued bytes fall back to, or below, the ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackpressureGuard {
    ceiling: u64,
}

impl BackpressureGuard {
    /// Creates a new `BackpressureGuard` with the given ceiling, in bytes.
    pub const fn new(ceiling: u64) -> Self {
        Self { ceiling }
    }

    /// Returns the ceiling, in bytes.
    pub const fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Returns `true` if the bytes currently queued for transmit exceed the ceiling.
    pub fn is_tripped(&self, stats: &ClusterStats) -> bool {
        stats.tx_bytes_buffered() > self.ceiling
    }
}
