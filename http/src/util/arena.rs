use bytes::{Bytes, BytesMut};

// reserve granularity. growth happens in whole chunks so repeated small
// appends do not trigger per byte reallocation.
const DEFAULT_CHUNK_SIZE: usize = 4096;

/// bump style byte arena for building small per request records: cache keys,
/// log lines, rewritten uris.
///
/// Bytes are appended to an open "stream" at the front of the arena and carved
/// out as one contiguous [Bytes] with [Arena::finish_stream]. The backing
/// storage grows in fixed chunks and is reused across requests after
/// [Arena::reset].
pub struct Arena {
    buf: BytesMut,
    chunk_size: usize,
    // start offset of the currently open stream.
    mark: Option<usize>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

impl Arena {
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "arena chunk size must be positive");
        Self {
            buf: BytesMut::new(),
            chunk_size,
            mark: None,
        }
    }

    /// open a new stream at the current front. panics when a stream is already
    /// open: streams never nest.
    pub fn start_stream(&mut self) {
        assert!(self.mark.is_none(), "arena stream already open");
        self.mark = Some(self.buf.len());
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn append_char(&mut self, c: u8) {
        self.reserve(1);
        self.buf.extend_from_slice(&[c]);
    }

    pub fn append_u64(&mut self, n: u64) {
        let mut fmt = itoa::Buffer::new();
        self.append(fmt.format(n).as_bytes());
    }

    /// close the open stream and hand its bytes out as one contiguous region.
    pub fn finish_stream(&mut self) -> Bytes {
        let mark = self.mark.take().expect("arena stream not open");
        self.buf.split_off(mark).freeze()
    }

    /// one shot convenience: copy `bytes` into the arena and return the owned
    /// region.
    pub fn copy(&mut self, bytes: &[u8]) -> Bytes {
        self.start_stream();
        self.append(bytes);
        self.finish_stream()
    }

    /// drop everything accumulated since the last reset. storage capacity that
    /// is not shared with carved out regions stays allocated for reuse.
    pub fn reset(&mut self) {
        self.mark = None;
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    fn reserve(&mut self, additional: usize) {
        // round the shortfall up to whole chunks.
        let spare = self.buf.capacity() - self.buf.len();
        if spare < additional {
            let shortfall = additional - spare;
            let chunks = shortfall.div_ceil(self.chunk_size);
            self.buf.reserve(spare + chunks * self.chunk_size);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_round_trip() {
        let mut arena = Arena::default();
        arena.start_stream();
        arena.append(b"host");
        arena.append_char(b'_');
        arena.append_u64(8080);
        let key = arena.finish_stream();
        assert_eq!(&key[..], b"host_8080");
    }

    #[test]
    fn sequential_streams_do_not_overlap() {
        let mut arena = Arena::with_chunk_size(8);
        arena.start_stream();
        arena.append(b"first-stream-outgrows-one-chunk");
        let a = arena.finish_stream();

        arena.start_stream();
        arena.append(b"second");
        let b = arena.finish_stream();

        assert_eq!(&a[..], b"first-stream-outgrows-one-chunk");
        assert_eq!(&b[..], b"second");
    }

    #[test]
    #[should_panic]
    fn nested_stream_panics() {
        let mut arena = Arena::default();
        arena.start_stream();
        arena.start_stream();
    }

    #[test]
    fn reset_reuses_storage() {
        let mut arena = Arena::default();
        arena.start_stream();
        arena.append(b"abc");
        drop(arena.finish_stream());
        arena.reset();
        assert_eq!(arena.len(), 0);
    }
}
