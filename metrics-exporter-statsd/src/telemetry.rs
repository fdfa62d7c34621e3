use metrics::{counter, Counter};

/// Sink telemetry.
///
/// Counters are registered with whichever recorder is installed when the sink is built, labeled with the cluster the
/// sink sends to. The overflow counter is the only signal that data was dropped because the collector could not keep
/// up.
#[derive(Clone)]
pub(crate) struct Telemetry {
    cx_overflow: Counter,
    cx_connect: Counter,
    cx_unavailable: Counter,
    cx_closed: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new(cluster: &str) -> Self {
        Self {
            cx_overflow: counter!("statsd.cx_overflow", "cluster" => cluster.to_string()),
            cx_connect: counter!("statsd.cx_connect", "cluster" => cluster.to_string()),
            cx_unavailable: counter!("statsd.cx_unavailable", "cluster" => cluster.to_string()),
            cx_closed: counter!("statsd.cx_closed", "cluster" => cluster.to_string()),
        }
    }

    /// Tracks a batch dropped because the connection backed up.
    pub fn increment_overflow(&self) {
        self.cx_overflow.increment(1);
    }

    /// Tracks a new connection being requested and put to use.
    pub fn increment_connect(&self) {
        self.cx_connect.increment(1);
    }

    /// Tracks a batch dropped because no connection could be obtained.
    pub fn increment_unavailable(&self) {
        self.cx_unavailable.increment(1);
    }

    /// Tracks a close event on a sink connection.
    pub fn increment_closed(&self) {
        self.cx_closed.increment(1);
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use metrics::Counter;

    use super::Telemetry;

    /// Raw counter values backing a [`Telemetry`] built for tests.
    #[derive(Clone, Default)]
    pub struct TelemetryCounters {
        pub cx_overflow: Arc<AtomicU64>,
        pub cx_connect: Arc<AtomicU64>,
        pub cx_unavailable: Arc<AtomicU64>,
        pub cx_closed: Arc<AtomicU64>,
    }

    impl TelemetryCounters {
        pub fn telemetry(&self) -> Telemetry {
            Telemetry {
                cx_overflow: Counter::from_arc(Arc::clone(&self.cx_overflow)),
                cx_connect: Counter::from_arc(Arc::clone(&self.cx_connect)),
                cx_unavailable: Counter::from_arc(Arc::clone(&self.cx_unavailable)),
                cx_closed: Counter::from_arc(Arc::clone(&self.cx_closed)),
            }
        }

        pub fn overflow(&self) -> u64 {
            self.cx_overflow.load(Ordering::SeqCst)
        }

        pub fn connects(&self) -> u64 {
            self.cx_connect.load(Ordering::SeqCst)
        }

        pub fn unavailable(&self) -> u64 {
            self.cx_unavailable.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> u64 {
            self.cx_closed.load(Ordering::SeqCst)
        }
    }
}
