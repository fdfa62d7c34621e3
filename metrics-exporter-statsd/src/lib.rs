//! Statsd sinks for flushing metrics from a pool of worker threads to a [statsd][statsd] collector.
//!
//! [statsd]: https://github.com/statsd/statsd
//!
//! # Usage
//!
//! Sinks are built once per process with [`StatsdBuilder`], then bound to each worker of the pool. Each worker drives
//! its own [`WorkerSink`] through the [`Sink`] interface, and owns the socket or connection behind it exclusively:
//!
//! ```no_run
//! # use metrics_exporter_statsd::{Dispatcher, Sink, StatsdBuilder};
//! # use std::time::Duration;
//! // One dispatcher per worker, created when the pool starts.
//! let dispatchers = vec![Dispatcher::new("worker_0"), Dispatcher::new("worker_1")];
//!
//! let sink = StatsdBuilder::default().build_udp("127.0.0.1:8125").expect("failed to build sink");
//! let mut worker_sinks = sink.worker_sinks(&dispatchers);
//!
//! // On each worker, once per flush interval:
//! let worker_sink = &mut worker_sinks[0];
//! worker_sink.begin_flush();
//! worker_sink.flush_counter("requests", 42);
//! worker_sink.flush_gauge("connections", 7);
//! worker_sink.end_flush();
//!
//! // And whenever a timed span completes:
//! worker_sink.on_timespan_complete("request_time", Duration::from_millis(12));
//!
//! // Between callbacks, the worker's scheduling loop drives pending connection activity, then drops anything that
//! // was closed along the way.
//! worker_sink.run_events();
//! dispatchers[0].clear_deferred_delete_list();
//! ```
//!
//! # Transports
//!
//! ## UDP
//!
//! Every sample is sent immediately, as a single line in its own datagram. Sends never block, and failures are
//! ignored: UDP delivery is best-effort anyway. Failing to open a socket on a worker is fatal.
//!
//! ## TCP
//!
//! Counters and gauges flushed during a cycle are encoded into a single batch which is written to the worker's
//! connection when the cycle ends. Timed spans are written as soon as they complete. Connections are obtained from a
//! [`ConnectionProvider`][upstream::ConnectionProvider], such as [`StaticClusterManager`][upstream::StaticClusterManager],
//! and are requested lazily and replaced after they close.
//!
//! Writes are queued rather than waited on, so a collector that cannot keep up shows as bytes piling up in the
//! cluster's send queues. Once they exceed the configured ceiling, batches are dropped and the worker's connection is
//! closed, and the `statsd.cx_overflow` counter is incremented.
//!
//! # Wire format
//!
//! Lines take the form `<prefix>.<name>:<value>|<type>\n`, where the type is `c` for counters, `g` for gauges, and `ms`
//! for timers. Histogram samples are sent as timers.
//!
//! # Telemetry
//!
//! The TCP sink reports its own behavior through the [`metrics`] facade, under the `statsd` namespace:
//! `statsd.cx_overflow`, `statsd.cx_connect`, `statsd.cx_unavailable`, and `statsd.cx_closed`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod backpressure;
pub use self::backpressure::BackpressureGuard;

mod buffer;
pub use self::buffer::FlushBuffer;

mod builder;
pub use self::builder::{BuildError, StatsdBuilder};

mod sink;
pub use self::sink::{Sink, WorkerSink};

mod tcp;
pub use self::tcp::{TcpFlusher, TcpStatsdSink};

mod telemetry;

mod thread_local;
pub use self::thread_local::{Dispatcher, DispatcherHandle, LocalSlot, Slot};

mod udp;
pub use self::udp::{UdpStatsdSink, UdpWriter};

pub mod upstream;

mod writer;
pub use self::writer::{LineEncoder, MetricType};
