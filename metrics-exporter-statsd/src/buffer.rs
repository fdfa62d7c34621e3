use bytes::{Bytes, BytesMut};

/// Growable byte buffer assembled from fixed-size slices.
///
/// Callers reserve a writable slice, encode directly into it, and commit it once full (or once the flush cycle ends).
/// Committing trims the slice to the bytes actually used and freezes it, so the committed content can be handed to the
/// network layer without copying. At most one slice is open at any time.
///
/// Slices are carved out of a single backing allocation which is reused across flush cycles once every committed chunk
/// referencing it has been released.
#[derive(Debug, Default)]
pub struct FlushBuffer {
    committed: Vec<Bytes>,
    committed_len: usize,
    arena: BytesMut,
    cursor: usize,
    open: bool,
}

impl FlushBuffer {
    /// Creates an empty `FlushBuffer`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new writable slice of exactly `size` bytes.
    pub fn reserve(&mut self, size: usize) {
        debug_assert!(!self.open, "a slice is already open");

        self.arena.clear();
        self.arena.resize(size, 0);
        self.cursor = 0;
        self.open = true;
    }

    /// Returns `true` if a slice is currently open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Returns the number of bytes still writable in the open slice.
    pub fn remaining(&self) -> usize {
        if self.open {
            self.arena.len() - self.cursor
        } else {
            0
        }
    }

    /// Returns the writable, unused region of the open slice.
    pub fn writable(&mut self) -> &mut [u8] {
        debug_assert!(self.open, "no slice is open");
        &mut self.arena[self.cursor..]
    }

    /// Marks `len` bytes of the open slice as written.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the remaining capacity of the open slice.
    pub fn advance(&mut self, len: usize) {
        assert!(len <= self.remaining(), "advanced past the end of the open slice");
        self.cursor += len;
    }

    /// Commits the open slice, trimming it to the bytes actually written.
    ///
    /// Returns the number of bytes committed. Empty slices are discarded rather than committed, and committing with no
    /// open slice does nothing.
    pub fn commit(&mut self) -> usize {
        if !self.open {
            return 0;
        }

        self.open = false;
        self.arena.truncate(self.cursor);
        self.cursor = 0;

        let chunk = self.arena.split().freeze();
        let len = chunk.len();
        if len > 0 {
            self.committed_len += len;
            self.committed.push(chunk);
        }

        len
    }

    /// Appends an already-built chunk as a committed slice.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        self.committed_len += chunk.len();
        self.committed.push(chunk);
    }

    /// Returns the number of committed bytes.
    pub fn len(&self) -> usize {
        self.committed_len
    }

    /// Returns `true` if no bytes have been committed.
    pub fn is_empty(&self) -> bool {
        self.committed_len == 0
    }

    /// Returns the number of bytes written to the open slice, or zero if no slice is open.
    pub fn open_len(&self) -> usize {
        if self.open {
            self.cursor
        } else {
            0
        }
    }

    /// Returns the number of committed slices.
    pub fn slice_count(&self) -> usize {
        self.committed.len()
    }

    /// Removes and yields every committed slice, in commit order.
    ///
    /// The buffer is empty as soon as this is called, whether or not the iterator is fully consumed.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Bytes> {
        self.committed_len = 0;
        self.committed.drain(..)
    }

    /// Discards all committed content.
    pub fn clear(&mut self) {
        self.committed.clear();
        self.committed_len = 0;
    }

    /// Copies the committed content into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.committed_len);
        for chunk in &self.committed {
            buf.extend_from_slice(chunk);
        }
        buf
    }
}

impl From<Bytes> for FlushBuffer {
    fn from(chunk: Bytes) -> Self {
        let mut buffer = FlushBuffer::new();
        buffer.append(chunk);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use proptest::{collection::vec as arb_vec, prelude::*};

    use super::FlushBuffer;

    fn write(buffer: &mut FlushBuffer, data: &[u8]) {
        buffer.writable()[..data.len()].copy_from_slice(data);
        buffer.advance(data.len());
    }

    #[test]
    fn commit_trims_to_used_bytes() {
        let mut buffer = FlushBuffer::new();
        buffer.reserve(64);
        assert!(buffer.is_open());
        assert_eq!(buffer.remaining(), 64);

        write(&mut buffer, b"envoy.a:1|c\n");
        assert_eq!(buffer.remaining(), 52);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.open_len(), 12);

        assert_eq!(buffer.commit(), 12);
        assert_eq!(buffer.open_len(), 0);
        assert!(!buffer.is_open());
        assert_eq!(buffer.remaining(), 0);
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.to_vec(), b"envoy.a:1|c\n");
    }

    #[test]
    fn slices_concatenate_in_order() {
        let mut buffer = FlushBuffer::new();
        for part in [&b"first\n"[..], &b"second\n"[..], &b"third\n"[..]] {
            buffer.reserve(16);
            write(&mut buffer, part);
            buffer.commit();
        }

        assert_eq!(buffer.slice_count(), 3);
        assert_eq!(buffer.to_vec(), b"first\nsecond\nthird\n");
    }

    #[test]
    fn empty_slice_is_not_committed() {
        let mut buffer = FlushBuffer::new();
        buffer.reserve(16);
        assert_eq!(buffer.commit(), 0);
        assert_eq!(buffer.slice_count(), 0);
        assert!(buffer.is_empty());

        // Committing without an open slice is a no-op.
        assert_eq!(buffer.commit(), 0);
    }

    #[test]
    fn drain_empties_buffer_and_allows_reuse() {
        let mut buffer = FlushBuffer::new();
        buffer.reserve(32);
        write(&mut buffer, b"envoy.a:1|c\n");
        buffer.commit();
        buffer.append(Bytes::from_static(b"envoy.b:2|g\n"));

        let drained: Vec<Bytes> = buffer.drain().collect();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.slice_count(), 0);

        // Drop the drained chunks so the arena can reclaim its allocation, then go again.
        drop(drained);
        buffer.reserve(32);
        write(&mut buffer, b"envoy.c:3|c\n");
        buffer.commit();
        assert_eq!(buffer.to_vec(), b"envoy.c:3|c\n");
    }

    #[test]
    fn committed_chunks_survive_slice_reuse() {
        let mut buffer = FlushBuffer::new();
        buffer.reserve(16);
        write(&mut buffer, b"aaaa");
        buffer.commit();

        let held: Vec<Bytes> = buffer.drain().collect();

        buffer.reserve(16);
        write(&mut buffer, b"bbbb");
        buffer.commit();

        assert_eq!(&held[0][..], b"aaaa");
        assert_eq!(buffer.to_vec(), b"bbbb");
    }

    #[test]
    fn clear_discards_committed_content() {
        let mut buffer = FlushBuffer::from(Bytes::from_static(b"envoy.t:5|ms\n"));
        assert_eq!(buffer.len(), 13);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.to_vec().is_empty());
    }

    #[test]
    #[should_panic(expected = "advanced past the end of the open slice")]
    fn advance_past_end_panics() {
        let mut buffer = FlushBuffer::new();
        buffer.reserve(4);
        buffer.advance(5);
    }

    proptest! {
        #[test]
        fn property_test_slice_rotation(slice_size in 8usize..256, writes in arb_vec(arb_vec(any::<u8>(), 0..8), 0..512)) {
            let mut buffer = FlushBuffer::new();
            let mut expected = Vec::new();

            buffer.reserve(slice_size);
            for data in &writes {
                if buffer.remaining() < data.len() {
                    buffer.commit();
                    buffer.reserve(slice_size);
                }

                write(&mut buffer, data);
                expected.extend_from_slice(data);
            }
            buffer.commit();

            prop_assert_eq!(buffer.len(), expected.len());
            prop_assert_eq!(buffer.to_vec(), expected);

            let drained: Vec<u8> = buffer.drain().flat_map(|chunk| chunk.to_vec()).collect();
            prop_assert_eq!(drained.len(), writes.iter().map(Vec::len).sum::<usize>());
            prop_assert!(buffer.is_empty());
        }
    }
}
