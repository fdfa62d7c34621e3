use std::time::Duration;

/// Widest decimal rendering of a `u64`.
const MAX_VALUE_DIGITS: usize = 20;

/// Bytes a line carries beyond the prefix and the metric name: the `:` separator, the value, the longest type suffix
/// (`|ms`), and the trailing newline.
pub(crate) const LINE_OVERHEAD: usize = 1 + MAX_VALUE_DIGITS + 3 + 1;

/// Statsd metric type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricType {
    /// Counter delta (`c`).
    Counter,

    /// Absolute gauge value (`g`).
    Gauge,

    /// Timer, or histogram sample, in milliseconds (`ms`).
    Timer,
}

impl MetricType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricType::Counter => b"|c",
            MetricType::Gauge => b"|g",
            MetricType::Timer => b"|ms",
        }
    }
}

/// Converts a span to whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn duration_to_millis(span: Duration) -> u64 {
    u64::try_from(span.as_millis()).unwrap_or(u64::MAX)
}

/// Formats metric samples as statsd lines.
///
/// Every line has the shape `<prefix>.<name>:<value>|<type>\n`. Lines are written directly into memory supplied by the
/// caller, so encoding never allocates. The caller is responsible for handing over at least
/// [`max_line_len`][LineEncoder::max_line_len] bytes; the encoder does not check for room beyond that.
#[derive(Clone, Debug)]
pub struct LineEncoder {
    prefix: Box<[u8]>,
}

impl LineEncoder {
    /// Creates a new `LineEncoder` that namespaces every metric under `prefix`.
    ///
    /// The prefix is separated from the metric name by a dot. An empty prefix emits the bare metric name.
    pub fn new(prefix: &str) -> Self {
        let mut buf = Vec::with_capacity(prefix.len() + 1);
        if !prefix.is_empty() {
            buf.extend_from_slice(prefix.as_bytes());
            buf.push(b'.');
        }

        Self { prefix: buf.into_boxed_slice() }
    }

    /// Returns the raw prefix, including the trailing dot.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Returns the number of bytes that must be available before encoding a line for `name`.
    pub fn max_line_len(&self, name: &str) -> usize {
        self.prefix.len() + name.len() + LINE_OVERHEAD
    }

    /// Encodes a single line into `dst`, returning the number of bytes written.
    ///
    /// # Panics
    ///
    /// Panics if `dst` is too small to hold the line. Callers avoid this by providing at least
    /// [`max_line_len`][LineEncoder::max_line_len] bytes.
    pub fn encode(&self, dst: &mut [u8], name: &str, value: u64, metric_type: MetricType) -> usize {
        debug_assert!(dst.len() >= self.max_line_len(name));

        let mut int_writer = itoa::Buffer::new();
        let value_str = int_writer.format(value);

        let mut pos = 0;
        put(dst, &mut pos, &self.prefix);
        put(dst, &mut pos, name.as_bytes());
        put(dst, &mut pos, b":");
        put(dst, &mut pos, value_str.as_bytes());
        put(dst, &mut pos, metric_type.as_bytes());
        put(dst, &mut pos, b"\n");
        pos
    }
}

fn put(dst: &mut [u8], pos: &mut usize, src: &[u8]) {
    let end = *pos + src.len();
    dst[*pos..end].copy_from_slice(src);
    *pos = end;
}
