use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

use tracing::{debug, error, trace};

use crate::{
    sink::{Sink, WorkerSink},
    thread_local::{Dispatcher, Slot},
    writer::{duration_to_millis, LineEncoder, MetricType},
};

/// A worker's UDP socket.
///
/// Every sample is encoded as a single line and sent in its own datagram, immediately. Sends never block and their
/// failures are ignored.
pub struct UdpWriter {
    socket: UdpSocket,
    encoder: Arc<LineEncoder>,
    scratch: Vec<u8>,
}

impl UdpWriter {
    /// Creates a new `UdpWriter` whose socket is associated with `server_address`.
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound or associated with the server address, an error is returned.
    pub fn new(server_address: SocketAddr, encoder: Arc<LineEncoder>) -> io::Result<Self> {
        let bind_addr = match server_address {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };

        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(server_address)?;
        socket.set_nonblocking(true)?;

        Ok(Self { socket, encoder, scratch: Vec::new() })
    }

    /// Returns the local address of the socket.
    ///
    /// # Errors
    ///
    /// If the local address cannot be retrieved, an error is returned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Returns the address of the server the socket sends to.
    ///
    /// # Errors
    ///
    /// If the peer address cannot be retrieved, an error is returned.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Sends a counter delta.
    pub fn write_counter(&mut self, name: &str, delta: u64) {
        self.send(name, delta, MetricType::Counter);
    }

    /// Sends an absolute gauge value.
    pub fn write_gauge(&mut self, name: &str, value: u64) {
        self.send(name, value, MetricType::Gauge);
    }

    /// Sends a timer value in milliseconds.
    pub fn write_timer(&mut self, name: &str, millis: u64) {
        self.send(name, millis, MetricType::Timer);
    }

    fn send(&mut self, name: &str, value: u64, metric_type: MetricType) {
        let max_len = self.encoder.max_line_len(name);
        if self.scratch.len() < max_len {
            self.scratch.resize(max_len, 0);
        }

        let len = self.encoder.encode(&mut self.scratch, name, value, metric_type);
        if let Err(e) = self.socket.send(&self.scratch[..len]) {
            trace!(metric = name, error = %e, "Failed to send datagram.");
        }
    }
}

impl Sink for UdpWriter {
    fn begin_flush(&mut self) {}

    fn flush_counter(&mut self, name: &str, delta: u64) {
        self.write_counter(name, delta);
    }

    fn flush_gauge(&mut self, name: &str, value: u64) {
        self.write_gauge(name, value);
    }

    fn end_flush(&mut self) {}

    fn on_timespan_complete(&mut self, name: &str, span: Duration) {
        self.write_timer(name, duration_to_millis(span));
    }
}

/// A statsd sink that sends each sample as a UDP datagram.
///
/// Each worker gets its own socket, opened the first time the worker uses the sink.
pub struct UdpStatsdSink {
    server_address: SocketAddr,
    slot: Slot<UdpWriter>,
}

impl UdpStatsdSink {
    pub(crate) fn new(server_address: SocketAddr, encoder: Arc<LineEncoder>) -> Self {
        let slot = Slot::new(move |dispatcher| match UdpWriter::new(server_address, Arc::clone(&encoder)) {
            Ok(writer) => {
                debug!(worker = dispatcher.name(), %server_address, "Opened statsd UDP socket.");
                writer
            }
            Err(e) => {
                error!(worker = dispatcher.name(), %server_address, error = %e, "Failed to open statsd UDP socket.");
                panic!("failed to open statsd UDP socket to {server_address}: {e}");
            }
        });

        Self { server_address, slot }
    }

    /// Returns the address of the statsd server.
    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }

    /// Binds the sink to a single worker.
    pub fn worker_sink(&self, dispatcher: &Dispatcher) -> WorkerSink<UdpWriter> {
        WorkerSink::new(self.slot.local(dispatcher))
    }

    /// Binds the sink to every worker in a pool, returning worker sinks indexed by worker.
    pub fn worker_sinks(&self, dispatchers: &[Dispatcher]) -> Vec<WorkerSink<UdpWriter>> {
        self.slot.locals(dispatchers).into_iter().map(WorkerSink::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{SocketAddr, UdpSocket},
        sync::Arc,
        time::Duration,
    };

    use crate::{sink::Sink, thread_local::Dispatcher, writer::LineEncoder};

    use super::UdpStatsdSink;

    fn receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("failed to bind receiver");
        socket.set_read_timeout(Some(Duration::from_secs(5))).expect("failed to set read timeout");
        let addr = socket.local_addr().expect("failed to get receiver address");
        (socket, addr)
    }

    fn recv_line(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).expect("no datagram received");
        String::from_utf8(buf[..len].to_vec()).expect("datagram was not UTF-8")
    }

    fn sink_for(addr: SocketAddr) -> UdpStatsdSink {
        UdpStatsdSink::new(addr, Arc::new(LineEncoder::new("envoy")))
    }

    #[test]
    fn one_datagram_per_sample() {
        let (receiver, addr) = receiver();
        let sink = sink_for(addr);
        let dispatcher = Dispatcher::new("worker_0");
        let mut worker = sink.worker_sink(&dispatcher);

        worker.begin_flush();
        worker.flush_counter("test_counter", 1);
        worker.flush_gauge("test_gauge", 2);
        worker.end_flush();
        worker.on_timespan_complete("test_timer", Duration::from_millis(5));

        assert_eq!(recv_line(&receiver), "envoy.test_counter:1|c\n");
        assert_eq!(recv_line(&receiver), "envoy.test_gauge:2|g\n");
        assert_eq!(recv_line(&receiver), "envoy.test_timer:5|ms\n");
    }

    #[test]
    fn histogram_is_sent_as_timer() {
        let (receiver, addr) = receiver();
        let sink = sink_for(addr);
        let dispatcher = Dispatcher::new("worker_0");
        let mut worker = sink.worker_sink(&dispatcher);

        worker.on_histogram_complete("histogram_test_timer", 15);
        worker.on_timespan_complete("histogram_test_timer", Duration::from_millis(15));

        let first = recv_line(&receiver);
        assert_eq!(first, "envoy.histogram_test_timer:15|ms\n");
        assert_eq!(recv_line(&receiver), first);
    }

    #[test]
    fn sockets_are_opened_lazily_per_worker() {
        let (_receiver, addr) = receiver();
        let sink = sink_for(addr);
        assert_eq!(sink.server_address(), addr);

        let dispatchers = [Dispatcher::new("worker_0"), Dispatcher::new("worker_1")];
        let mut workers = sink.worker_sinks(&dispatchers);
        assert!(workers.iter().all(|worker| !worker.is_initialized()));

        // Sending nothing still forces the socket open.
        let first = workers[0].get().local_addr().expect("no local address");
        let second = workers[1].get().local_addr().expect("no local address");
        assert_ne!(first, second);
        assert_eq!(workers[0].get().peer_addr().expect("no peer address"), addr);
    }

    #[test]
    #[should_panic(expected = "failed to open statsd UDP socket")]
    fn socket_failure_on_worker_is_fatal() {
        // Associating with the broadcast address is refused without SO_BROADCAST.
        let sink = sink_for(SocketAddr::from(([255, 255, 255, 255], 8125)));
        let dispatcher = Dispatcher::new("worker_0");
        let mut worker = sink.worker_sink(&dispatcher);

        worker.flush_counter("test_counter", 1);
    }

    #[test]
    fn send_failures_are_ignored() {
        // Nothing listens on the receiver's port once it is dropped, so sends may be refused.
        let (receiver, addr) = receiver();
        drop(receiver);

        let sink = sink_for(addr);
        let dispatcher = Dispatcher::new("worker_0");
        let mut worker = sink.worker_sink(&dispatcher);
        for _ in 0..4 {
            worker.flush_counter("test_counter", 1);
        }
    }
}
