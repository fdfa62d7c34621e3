use std::{mem, sync::Arc, time::Duration};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::{
    backpressure::BackpressureGuard,
    buffer::FlushBuffer,
    builder::BuildError,
    sink::{Sink, WorkerSink},
    telemetry::Telemetry,
    thread_local::{Dispatcher, DispatcherHandle, Slot},
    upstream::{
        ClientConnection, CloseType, ClusterStats, ConnectionCallbacks, ConnectionEvent, ConnectionProvider,
        ConnectionState,
    },
    writer::{duration_to_millis, LineEncoder, MetricType},
};

/// State shared by every worker of a TCP sink.
struct Shared {
    cluster_name: String,
    provider: Arc<dyn ConnectionProvider>,
    cluster_stats: Arc<ClusterStats>,
    encoder: Arc<LineEncoder>,
    guard: BackpressureGuard,
    slice_size: usize,
    telemetry: Telemetry,
}

/// A statsd sink that batches samples over a TCP connection to a named cluster.
///
/// Each worker gets its own [`TcpFlusher`], with its own connection, built the first time the worker uses the sink.
pub struct TcpStatsdSink {
    shared: Arc<Shared>,
    slot: Slot<TcpFlusher>,
}

impl TcpStatsdSink {
    pub(crate) fn new(
        cluster_name: String,
        provider: Arc<dyn ConnectionProvider>,
        encoder: Arc<LineEncoder>,
        guard: BackpressureGuard,
        slice_size: usize,
        telemetry: Telemetry,
    ) -> Result<Self, BuildError> {
        let cluster_stats = provider
            .cluster_stats(&cluster_name)
            .ok_or_else(|| BuildError::UnknownCluster { name: cluster_name.clone() })?;

        let shared =
            Arc::new(Shared { cluster_name, provider, cluster_stats, encoder, guard, slice_size, telemetry });

        let slot = {
            let shared = Arc::clone(&shared);
            Slot::new(move |dispatcher| TcpFlusher::new(Arc::clone(&shared), dispatcher.clone()))
        };

        Ok(Self { shared, slot })
    }

    /// Returns the name of the cluster samples are sent to.
    pub fn cluster_name(&self) -> &str {
        &self.shared.cluster_name
    }

    /// Returns the statistics shared by every connection to the cluster.
    pub fn cluster_stats(&self) -> &Arc<ClusterStats> {
        &self.shared.cluster_stats
    }

    /// Binds the sink to a single worker.
    pub fn worker_sink(&self, dispatcher: &Dispatcher) -> WorkerSink<TcpFlusher> {
        WorkerSink::new(self.slot.local(dispatcher))
    }

    /// Binds the sink to every worker in a pool, returning worker sinks indexed by worker.
    pub fn worker_sinks(&self, dispatchers: &[Dispatcher]) -> Vec<WorkerSink<TcpFlusher>> {
        self.slot.locals(dispatchers).into_iter().map(WorkerSink::new).collect()
    }
}

/// A worker's TCP connection to the statsd cluster.
///
/// Counters and gauges are encoded into a [`FlushBuffer`] over the course of a flush cycle, and the whole batch is
/// handed to the connection when the cycle ends. Timed spans skip the batch and are written as soon as they complete.
///
/// The connection is requested lazily, on the first write that passes the backpressure check, and is replaced on the
/// first write after it closes. Batches that cannot be delivered are dropped: there is no retry beyond the next cycle.
pub struct TcpFlusher {
    shared: Arc<Shared>,
    dispatcher: DispatcherHandle,
    connection: Option<Box<dyn ClientConnection>>,
    buffer: FlushBuffer,
}

impl TcpFlusher {
    fn new(shared: Arc<Shared>, dispatcher: DispatcherHandle) -> Self {
        Self { shared, dispatcher, connection: None, buffer: FlushBuffer::new() }
    }

    /// Returns the state of the current connection, or `None` if there is no connection.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection.as_ref().map(|connection| connection.state())
    }

    /// Returns the number of bytes batched in the current flush cycle that have not yet been handed to the connection.
    ///
    /// Includes bytes written to the slice that is still open.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.buffer.open_len()
    }

    fn flush_line(&mut self, name: &str, value: u64, metric_type: MetricType) {
        let needed = self.shared.encoder.max_line_len(name);
        if self.buffer.remaining() < needed {
            // Rotate to a fresh slice. A line that would not fit in a whole slice gets one of its own.
            self.buffer.commit();
            self.buffer.reserve(needed.max(self.shared.slice_size));
        }

        let len = self.shared.encoder.encode(self.buffer.writable(), name, value, metric_type);
        self.buffer.advance(len);
    }

    fn write(&mut self, buffer: &mut FlushBuffer) {
        self.process_connection_events();

        if self.shared.guard.is_tripped(&self.shared.cluster_stats) {
            if let Some(mut connection) = self.connection.take() {
                connection.close(CloseType::NoFlush);
                self.dispatcher.deferred_delete(connection);
            }

            self.shared.telemetry.increment_overflow();
            warn!(
                cluster = %self.shared.cluster_name,
                buffered = self.shared.cluster_stats.tx_bytes_buffered(),
                ceiling = self.shared.guard.ceiling(),
                dropped = buffer.len(),
                "Statsd connection backed up. Dropping batch."
            );
            buffer.clear();
            return;
        }

        if self.connection.is_none() {
            let Some(mut connection) = self.shared.provider.tcp_conn_for_cluster(&self.shared.cluster_name) else {
                self.shared.telemetry.increment_unavailable();
                debug!(
                    cluster = %self.shared.cluster_name,
                    worker = self.dispatcher.name(),
                    dropped = buffer.len(),
                    "No statsd connection available. Dropping batch."
                );
                buffer.clear();
                return;
            };

            connection.set_buffer_stats(Arc::clone(&self.shared.cluster_stats));
            connection.connect();
            self.shared.telemetry.increment_connect();
            debug!(cluster = %self.shared.cluster_name, worker = self.dispatcher.name(), "Requested statsd connection.");

            self.connection = Some(connection);
        }

        if let Some(connection) = self.connection.as_mut() {
            trace!(cluster = %self.shared.cluster_name, bytes = buffer.len(), "Writing batch.");
            connection.write(buffer);
        }
        buffer.clear();
    }

    fn process_connection_events(&mut self) {
        while let Some(event) = self.connection.as_mut().and_then(|connection| connection.next_event()) {
            self.on_event(event);
        }
    }
}

impl ConnectionCallbacks for TcpFlusher {
    fn on_event(&mut self, event: ConnectionEvent) {
        if !event.is_close() {
            debug!(cluster = %self.shared.cluster_name, worker = self.dispatcher.name(), "Statsd connection established.");
            return;
        }

        self.shared.telemetry.increment_closed();
        debug!(cluster = %self.shared.cluster_name, worker = self.dispatcher.name(), ?event, "Statsd connection closed.");

        // The connection may still be unwinding the call that raised this event, so hand it to the dispatcher.
        if let Some(connection) = self.connection.take() {
            self.dispatcher.deferred_delete(connection);
        }
    }
}

impl Sink for TcpFlusher {
    fn begin_flush(&mut self) {
        debug_assert!(self.buffer.is_empty(), "flush buffer was not drained by the previous cycle");
        debug_assert!(!self.buffer.is_open(), "flush cycle already open");

        self.buffer.reserve(self.shared.slice_size);
    }

    fn flush_counter(&mut self, name: &str, delta: u64) {
        self.flush_line(name, delta, MetricType::Counter);
    }

    fn flush_gauge(&mut self, name: &str, value: u64) {
        self.flush_line(name, value, MetricType::Gauge);
    }

    fn end_flush(&mut self) {
        self.buffer.commit();

        let mut buffer = mem::take(&mut self.buffer);
        self.write(&mut buffer);
        buffer.clear();
        self.buffer = buffer;
    }

    fn on_timespan_complete(&mut self, name: &str, span: Duration) {
        let encoder = &self.shared.encoder;
        let mut line = BytesMut::zeroed(encoder.max_line_len(name));
        let len = encoder.encode(&mut line, name, duration_to_millis(span), MetricType::Timer);
        line.truncate(len);

        let mut buffer = FlushBuffer::from(line.freeze());
        self.write(&mut buffer);
    }

    fn run_events(&mut self) {
        self.process_connection_events();
    }
}

impl Drop for TcpFlusher {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            debug!(cluster = %self.shared.cluster_name, worker = self.dispatcher.name(), "Closing statsd connection.");
            connection.close(CloseType::NoFlush);
        }
    }
}
