use std::{
    io,
    net::{SocketAddr, ToSocketAddrs as _},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    backpressure::BackpressureGuard,
    tcp::TcpStatsdSink,
    telemetry::Telemetry,
    udp::{UdpStatsdSink, UdpWriter},
    upstream::ConnectionProvider,
    writer::LineEncoder,
};

const DEFAULT_PREFIX: &str = "envoy";
const DEFAULT_MAX_BUFFERED_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_FLUSH_SLICE_SIZE: usize = 16 * 1024;

/// Errors that could occur while building a statsd sink.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse or resolve the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the failure.
        reason: String,
    },

    /// The connection provider does not know the requested cluster.
    #[error("unknown cluster: {name}")]
    UnknownCluster {
        /// Name of the cluster.
        name: String,
    },

    /// The metric prefix cannot be used in a statsd line.
    #[error("invalid prefix: {reason}")]
    InvalidPrefix {
        /// Details about the failure.
        reason: String,
    },

    /// The flush slice size was zero.
    #[error("flush slice size must be greater than zero")]
    InvalidSliceSize,

    /// Failed to open a socket to the remote address.
    #[error("failed to open socket: {0}")]
    Socket(#[from] io::Error),
}

/// Builder for a statsd sink.
pub struct StatsdBuilder {
    prefix: String,
    max_buffered_bytes: u64,
    flush_slice_size: usize,
}

impl StatsdBuilder {
    /// Sets the prefix that every metric name is namespaced under.
    ///
    /// Lines are emitted as `<prefix>.<name>`. An empty prefix emits the bare metric name.
    ///
    /// Defaults to `envoy`.
    ///
    /// # Errors
    ///
    /// If the prefix contains a character that is meaningful in a statsd line (`:`, `|`, or a newline), an error will
    /// be returned indicating the reason.
    pub fn with_prefix<P>(mut self, prefix: P) -> Result<Self, BuildError>
    where
        P: Into<String>,
    {
        let prefix = prefix.into();
        if let Some(c) = prefix.chars().find(|c| matches!(c, ':' | '|' | '\n')) {
            return Err(BuildError::InvalidPrefix { reason: format!("prefix contains reserved character {c:?}") });
        }

        self.prefix = prefix;
        Ok(self)
    }

    /// Sets the maximum number of bytes that may be queued for transmit before batches are dropped.
    ///
    /// This applies to the TCP sink only. When the bytes queued across every connection to the cluster exceed this
    /// ceiling, the worker's connection is closed without flushing, the batch is dropped, and the
    /// `statsd.cx_overflow` counter is incremented.
    ///
    /// Defaults to 16 MiB.
    #[must_use]
    pub fn with_max_buffered_bytes(mut self, max_buffered_bytes: u64) -> Self {
        self.max_buffered_bytes = max_buffered_bytes;
        self
    }

    /// Sets the size of each slice that a flush cycle's batch is encoded into.
    ///
    /// This applies to the TCP sink only. Larger slices mean fewer allocations for large batches, at the cost of more
    /// memory held per worker.
    ///
    /// Defaults to 16 KiB.
    ///
    /// # Errors
    ///
    /// If the slice size is zero, an error will be returned.
    pub fn with_flush_slice_size(mut self, flush_slice_size: usize) -> Result<Self, BuildError> {
        if flush_slice_size == 0 {
            return Err(BuildError::InvalidSliceSize);
        }

        self.flush_slice_size = flush_slice_size;
        Ok(self)
    }

    /// Builds a sink that sends each sample as a UDP datagram to `addr`, in the format of `<host>:<port>`.
    ///
    /// If the address resolves to more than one socket address, the first is used.
    ///
    /// # Errors
    ///
    /// If the address cannot be resolved, or a socket cannot be opened to it, an error will be returned.
    pub fn build_udp<A>(self, addr: A) -> Result<UdpStatsdSink, BuildError>
    where
        A: AsRef<str>,
    {
        let server_address = addr
            .as_ref()
            .to_socket_addrs()
            .map_err(|e| BuildError::InvalidRemoteAddress { reason: e.to_string() })?
            .next()
            .ok_or_else(|| BuildError::InvalidRemoteAddress {
                reason: format!("{} did not resolve to any address", addr.as_ref()),
            })?;

        self.build_udp_to(server_address)
    }

    /// Builds a sink that sends each sample as a UDP datagram to the given port on the loopback interface.
    ///
    /// # Errors
    ///
    /// If a socket cannot be opened, an error will be returned.
    pub fn build_udp_local_port(self, port: u16) -> Result<UdpStatsdSink, BuildError> {
        self.build_udp_to(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn build_udp_to(self, server_address: SocketAddr) -> Result<UdpStatsdSink, BuildError> {
        let encoder = Arc::new(LineEncoder::new(&self.prefix));

        // Workers panic if they cannot open a socket, so probe once up front.
        let probe = UdpWriter::new(server_address, Arc::clone(&encoder))?;
        debug!(local_addr = ?probe.local_addr().ok(), %server_address, "Probed statsd UDP socket.");
        drop(probe);

        info!(%server_address, prefix = %self.prefix, "Built statsd UDP sink.");
        Ok(UdpStatsdSink::new(server_address, encoder))
    }

    /// Builds a sink that batches samples over TCP connections to `cluster`, obtained from `provider`.
    ///
    /// # Errors
    ///
    /// If `provider` does not know the cluster, an error will be returned.
    pub fn build_tcp<C>(self, cluster: C, provider: Arc<dyn ConnectionProvider>) -> Result<TcpStatsdSink, BuildError>
    where
        C: Into<String>,
    {
        let cluster = cluster.into();
        let telemetry = Telemetry::new(&cluster);
        let sink = TcpStatsdSink::new(
            cluster,
            provider,
            Arc::new(LineEncoder::new(&self.prefix)),
            BackpressureGuard::new(self.max_buffered_bytes),
            self.flush_slice_size,
            telemetry,
        )?;

        info!(
            cluster = sink.cluster_name(),
            prefix = %self.prefix,
            max_buffered_bytes = self.max_buffered_bytes,
            flush_slice_size = self.flush_slice_size,
            "Built statsd TCP sink."
        );
        Ok(sink)
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            prefix: DEFAULT_PREFIX.to_string(),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            flush_slice_size: DEFAULT_FLUSH_SLICE_SIZE,
        }
    }
}
