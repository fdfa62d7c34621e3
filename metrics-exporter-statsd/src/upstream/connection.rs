use std::{
    collections::VecDeque,
    io::{self, Read as _, Write as _},
    net::SocketAddr,
    sync::Arc,
};

use bytes::{Buf as _, Bytes};
use mio::net::TcpStream;
use tracing::{debug, error, trace};

use crate::buffer::FlushBuffer;

use super::{ClientConnection, CloseType, ClusterStats, ConnectionEvent, ConnectionState};

/// Outcome of driving the socket once.
enum Drive {
    Idle,
    Closed(ConnectionEvent),
}

/// A non-blocking TCP connection with an unbounded send queue.
///
/// The connection is never registered with an event loop: all I/O happens when the owner writes to it or polls it for
/// events. Queued bytes are reported to the attached [`ClusterStats`] so that the owner can detect the peer falling
/// behind.
pub struct TcpConnection {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    state: ConnectionState,
    pending: VecDeque<Bytes>,
    pending_len: u64,
    events: VecDeque<ConnectionEvent>,
    stats: Option<Arc<ClusterStats>>,
}

impl TcpConnection {
    /// Creates a new, unconnected `TcpConnection` to `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            state: ConnectionState::Connecting,
            pending: VecDeque::new(),
            pending_len: 0,
            events: VecDeque::new(),
            stats: None,
        }
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the number of bytes queued but not yet written.
    pub fn pending_len(&self) -> u64 {
        self.pending_len
    }

    fn discard_pending(&mut self) {
        if self.pending_len > 0 {
            trace!(addr = %self.addr, discarded = self.pending_len, "Discarding queued bytes.");
        }

        if let Some(stats) = &self.stats {
            stats.sub_tx_bytes_buffered(self.pending_len);
        }
        self.pending.clear();
        self.pending_len = 0;
    }

    /// Tears the connection down and raises `event`.
    fn terminate(&mut self, event: ConnectionEvent) {
        if self.state == ConnectionState::Closed {
            return;
        }

        self.discard_pending();
        self.stream = None;
        self.state = ConnectionState::Closed;
        if let Some(stats) = &self.stats {
            stats.inc_cx_destroy();
        }
        self.events.push_back(event);
    }

    fn drive(&mut self) {
        if let Drive::Closed(event) = self.drive_socket() {
            self.terminate(event);
            return;
        }

        if self.state == ConnectionState::Closing && self.pending.is_empty() {
            self.terminate(ConnectionEvent::LocalClose);
        }
    }

    fn drive_socket(&mut self) -> Drive {
        let Some(stream) = self.stream.as_mut() else {
            return Drive::Idle;
        };

        if self.state == ConnectionState::Connecting {
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => {
                    debug!(addr = %self.addr, error = %e, "Connection attempt failed.");
                    return Drive::Closed(ConnectionEvent::RemoteClose);
                }
            }

            match stream.peer_addr() {
                Ok(_) => {
                    debug!(addr = %self.addr, "Connection established.");
                    self.state = ConnectionState::Open;
                    self.events.push_back(ConnectionEvent::Connected);
                }
                // Still handshaking.
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected || would_block(e) => {
                    return Drive::Idle
                }
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "Connection attempt failed.");
                    return Drive::Closed(ConnectionEvent::RemoteClose);
                }
            }
        }

        // Anything readable is either EOF or noise.
        let mut scratch = [0u8; 512];
        loop {
            match stream.read(&mut scratch) {
                Ok(0) => {
                    debug!(addr = %self.addr, "Connection closed by peer.");
                    return Drive::Closed(ConnectionEvent::RemoteClose);
                }
                Ok(_) => continue,
                Err(ref e) if would_block(e) => break,
                Err(ref e) if interrupted(e) => continue,
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "Connection read failed.");
                    return Drive::Closed(ConnectionEvent::RemoteClose);
                }
            }
        }

        loop {
            let Some(chunk) = self.pending.front_mut() else {
                return Drive::Idle;
            };

            match stream.write(chunk) {
                // Zero write means the peer is gone.
                Ok(0) => {
                    debug!(addr = %self.addr, "Zero-length write, closing connection.");
                    return Drive::Closed(ConnectionEvent::RemoteClose);
                }
                Ok(n) => {
                    if n < chunk.len() {
                        // Keep the unsent tail at the front of the queue so lines are never interleaved.
                        chunk.advance(n);
                        trace!(addr = %self.addr, written = n, remaining = chunk.len(), "Partial write.");
                    } else {
                        self.pending.pop_front();
                    }

                    let len = n as u64;
                    self.pending_len -= len;
                    if let Some(stats) = &self.stats {
                        stats.sub_tx_bytes_buffered(len);
                        stats.add_tx_bytes_total(len);
                    }
                }
                Err(ref e) if would_block(e) => return Drive::Idle,
                Err(ref e) if interrupted(e) => continue,
                Err(e) => {
                    error!(addr = %self.addr, error = %e, "Write failed.");
                    return Drive::Closed(ConnectionEvent::RemoteClose);
                }
            }
        }
    }
}

impl ClientConnection for TcpConnection {
    fn connect(&mut self) {
        if self.stream.is_some() || self.state != ConnectionState::Connecting {
            return;
        }

        match TcpStream::connect(self.addr) {
            Ok(stream) => {
                debug!(addr = %self.addr, "Connecting.");
                self.stream = Some(stream);
            }
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "Failed to start connecting.");
                self.terminate(ConnectionEvent::RemoteClose);
            }
        }
    }

    fn write(&mut self, buffer: &mut FlushBuffer) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            trace!(addr = %self.addr, dropped = buffer.len(), "Write to closed connection.");
            buffer.clear();
            return;
        }

        for chunk in buffer.drain() {
            let len = chunk.len() as u64;
            self.pending_len += len;
            if let Some(stats) = &self.stats {
                stats.add_tx_bytes_buffered(len);
            }
            self.pending.push_back(chunk);
        }

        self.drive();
    }

    fn close(&mut self, close_type: CloseType) {
        match (close_type, self.state) {
            (_, ConnectionState::Closed) => {}
            (CloseType::NoFlush, _) => self.terminate(ConnectionEvent::LocalClose),
            (CloseType::FlushWrite, _) => {
                self.state = ConnectionState::Closing;
                self.drive();
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_buffer_stats(&mut self, stats: Arc<ClusterStats>) {
        stats.add_tx_bytes_buffered(self.pending_len);
        if let Some(previous) = self.stats.replace(stats) {
            previous.sub_tx_bytes_buffered(self.pending_len);
        }
    }

    fn next_event(&mut self) -> Option<ConnectionEvent> {
        if self.events.is_empty() {
            self.drive();
        }

        self.events.pop_front()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // Whatever is still queued never makes it out, so stop counting it as buffered.
        self.discard_pending();
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
