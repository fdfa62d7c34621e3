use std::time::Duration;

use crate::thread_local::{DispatcherHandle, LocalSlot};

/// A destination for flushed stats.
///
/// The stats registry drives a sink once per flush interval on each worker: [`begin_flush`][Sink::begin_flush], then
/// any number of [`flush_counter`][Sink::flush_counter] and [`flush_gauge`][Sink::flush_gauge] calls, then
/// [`end_flush`][Sink::end_flush]. Completed timed spans are reported independently of that cycle.
///
/// Sinks are best-effort: none of these methods report failure to the caller.
pub trait Sink {
    /// Starts a flush cycle.
    fn begin_flush(&mut self);

    /// Flushes a counter delta.
    fn flush_counter(&mut self, name: &str, delta: u64);

    /// Flushes an absolute gauge value.
    fn flush_gauge(&mut self, name: &str, value: u64);

    /// Ends the flush cycle, sending whatever was flushed during it.
    fn end_flush(&mut self);

    /// Reports a completed histogram sample.
    ///
    /// Statsd has no notion of histograms, so by default the value is reported as a timer in milliseconds.
    fn on_histogram_complete(&mut self, name: &str, value: u64) {
        self.on_timespan_complete(name, Duration::from_millis(value));
    }

    /// Reports a completed timed span.
    fn on_timespan_complete(&mut self, name: &str, span: Duration);

    /// Drives any pending network activity and handles connection events.
    ///
    /// Called by the worker's scheduling loop between flush cycles.
    fn run_events(&mut self) {}
}

/// A worker's view of a sink.
///
/// Wraps the worker's slot, building the per-worker sink object the first time it is used.
pub struct WorkerSink<T> {
    slot: LocalSlot<T>,
}

impl<T> WorkerSink<T> {
    pub(crate) fn new(slot: LocalSlot<T>) -> Self {
        Self { slot }
    }

    /// Returns the per-worker sink object, building it first if necessary.
    pub fn get(&mut self) -> &mut T {
        self.slot.get()
    }

    /// Returns `true` if the per-worker sink object has been built.
    pub fn is_initialized(&self) -> bool {
        self.slot.is_initialized()
    }

    /// Returns the handle of the worker this sink is bound to.
    pub fn dispatcher(&self) -> &DispatcherHandle {
        self.slot.dispatcher()
    }

    /// Tears down the per-worker sink object without flushing it.
    pub fn shutdown(&mut self) {
        self.slot.shutdown();
    }
}

impl<T: Sink> Sink for WorkerSink<T> {
    fn begin_flush(&mut self) {
        self.slot.get().begin_flush();
    }

    fn flush_counter(&mut self, name: &str, delta: u64) {
        self.slot.get().flush_counter(name, delta);
    }

    fn flush_gauge(&mut self, name: &str, value: u64) {
        self.slot.get().flush_gauge(name, value);
    }

    fn end_flush(&mut self) {
        self.slot.get().end_flush();
    }

    fn on_histogram_complete(&mut self, name: &str, value: u64) {
        self.slot.get().on_histogram_complete(name, value);
    }

    fn on_timespan_complete(&mut self, name: &str, span: Duration) {
        self.slot.get().on_timespan_complete(name, span);
    }

    fn run_events(&mut self) {
        // Nothing can be pending for an object that was never built.
        if let Some(sink) = self.slot.try_get() {
            sink.run_events();
        }
    }
}
