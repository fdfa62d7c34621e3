//! Upstream connection-provider capability.
//!
//! The TCP sink never opens sockets itself. Instead, it asks a [`ConnectionProvider`] for a connection to a named
//! cluster, and drives that connection through the [`ClientConnection`] interface. [`StaticClusterManager`] is a
//! provider over a fixed set of hosts, backed by non-blocking TCP streams.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::buffer::FlushBuffer;

mod cluster;
pub use self::cluster::StaticClusterManager;

mod connection;
pub use self::connection::TcpConnection;

/// How a connection should be closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseType {
    /// Close immediately, discarding anything still queued for transmit.
    NoFlush,

    /// Finish writing anything queued for transmit, then close.
    FlushWrite,
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, or the handshake is still in progress. Writes are queued.
    Connecting,

    /// Handshake completed.
    Open,

    /// A flushing close was requested and queued data is still being written.
    Closing,

    /// Closed, either locally or by the peer.
    Closed,
}

/// Events raised by a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Connected,

    /// The peer closed the connection, or it failed.
    RemoteClose,

    /// The connection was closed locally.
    LocalClose,
}

impl ConnectionEvent {
    /// Returns `true` if this event ends the connection.
    pub const fn is_close(self) -> bool {
        matches!(self, ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose)
    }
}

/// Receives events raised by a connection.
pub trait ConnectionCallbacks {
    /// Handles a single connection event.
    fn on_event(&mut self, event: ConnectionEvent);
}

/// A byte-stream connection to an upstream host.
///
/// Connections are driven by their owner: writes are queued and flushed opportunistically, without ever blocking the
/// calling thread, and events are surfaced through [`next_event`][ClientConnection::next_event].
pub trait ClientConnection: Send {
    /// Starts connecting.
    ///
    /// Returns without waiting for the handshake to complete.
    fn connect(&mut self);

    /// Moves all committed data out of `buffer` and into the connection's send queue.
    ///
    /// The buffer is always left empty. Returning does not imply the data reached the peer.
    fn write(&mut self, buffer: &mut FlushBuffer);

    /// Closes the connection.
    fn close(&mut self, close_type: CloseType);

    /// Returns the current state of the connection.
    fn state(&self) -> ConnectionState;

    /// Attaches the statistics that this connection reports its buffering and transmit activity to.
    fn set_buffer_stats(&mut self, stats: Arc<ClusterStats>);

    /// Drives any pending I/O and returns the next event raised by the connection, if any.
    fn next_event(&mut self) -> Option<ConnectionEvent>;
}

/// Resolves named clusters to connections.
pub trait ConnectionProvider: Send + Sync {
    /// Returns the shared statistics for the given cluster, or `None` if the cluster is unknown.
    fn cluster_stats(&self, cluster: &str) -> Option<Arc<ClusterStats>>;

    /// Creates a new, unconnected connection to a host in the given cluster.
    ///
    /// Returns `None` if no connection can be obtained, such as when the cluster is unknown or has no hosts.
    fn tcp_conn_for_cluster(&self, cluster: &str) -> Option<Box<dyn ClientConnection>>;
}

/// Connection statistics shared by every connection to a cluster.
///
/// All counters are updated with relaxed ordering: readers get an eventually consistent view, which is all the
/// backpressure check needs.
#[derive(Debug, Default)]
pub struct ClusterStats {
    cx_total: AtomicU64,
    cx_destroy: AtomicU64,
    tx_bytes_total: AtomicU64,
    tx_bytes_buffered: AtomicU64,
}

impl ClusterStats {
    /// Creates a new, zeroed `ClusterStats`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of connections created.
    pub fn cx_total(&self) -> u64 {
        self.cx_total.load(Ordering::Relaxed)
    }

    /// Records a connection being created.
    pub fn inc_cx_total(&self) {
        self.cx_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of connections destroyed.
    pub fn cx_destroy(&self) -> u64 {
        self.cx_destroy.load(Ordering::Relaxed)
    }

    /// Records a connection being destroyed.
    pub fn inc_cx_destroy(&self) {
        self.cx_destroy.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of bytes written to the network.
    pub fn tx_bytes_total(&self) -> u64 {
        self.tx_bytes_total.load(Ordering::Relaxed)
    }

    /// Records `bytes` being written to the network.
    pub fn add_tx_bytes_total(&self, bytes: u64) {
        self.tx_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns the number of bytes queued for transmit but not yet written.
    pub fn tx_bytes_buffered(&self) -> u64 {
        self.tx_bytes_buffered.load(Ordering::Relaxed)
    }

    /// Records `bytes` being queued for transmit.
    pub fn add_tx_bytes_buffered(&self, bytes: u64) {
        self.tx_bytes_buffered.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records `bytes` leaving the transmit queue, whether written or discarded.
    pub fn sub_tx_bytes_buffered(&self, bytes: u64) {
        let _ = self.tx_bytes_buffered.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(bytes))
        });
    }

    /// Overrides the number of bytes queued for transmit.
    pub fn set_tx_bytes_buffered(&self, bytes: u64) {
        self.tx_bytes_buffered.store(bytes, Ordering::Relaxed);
    }
}
