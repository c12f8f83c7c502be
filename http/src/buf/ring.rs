//! fixed capacity byte ring with an async producer/consumer pair on top.
//!
//! the ring is the pipe between two protocol state machines that must not stall
//! each other: a proxied backend response is written into it by the client
//! protocol and drained by the server protocol at the socket's pace.

use core::{
    cell::RefCell,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use std::{io, rc::Rc};

use bytes::{Bytes, BytesMut};
use futures_core::stream::Stream;

/// byte ring over a fixed storage region.
///
/// `read == write` is ambiguous between empty and full; `last_write` breaks the
/// tie: the ring is full after a write landed on the boundary and empty after a
/// read did.
pub struct RingBuffer {
    storage: BytesMut,
    capacity: usize,
    read: usize,
    write: usize,
    last_write: bool,
    eof: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_storage(BytesMut::new(), capacity)
    }

    /// build the ring over caller provided storage, typically borrowed from a
    /// [RecordPool](crate::util::pool::RecordPool). reclaim it with
    /// [RingBuffer::into_storage].
    pub fn with_storage(mut storage: BytesMut, capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        storage.clear();
        storage.resize(capacity, 0);
        Self {
            storage,
            capacity,
            read: 0,
            write: 0,
            last_write: false,
            eof: false,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write && !self.last_write
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read == self.write && self.last_write
    }

    pub fn len(&self) -> usize {
        if self.is_full() {
            self.capacity
        } else if self.write >= self.read {
            self.write - self.read
        } else {
            self.capacity - self.read + self.write
        }
    }

    /// mark end of input. readers drain what is buffered and then observe eof.
    pub fn close(&mut self) {
        self.eof = true;
    }

    pub fn is_closed(&self) -> bool {
        self.eof
    }

    /// true once closed and fully drained.
    pub fn is_eof_reached(&self) -> bool {
        self.eof && self.is_empty()
    }

    /// copy from `src` into the ring. returns bytes accepted.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut written = 0;
        while written < src.len() && !self.is_full() {
            let end = if self.read > self.write { self.read } else { self.capacity };
            let n = (end - self.write).min(src.len() - written);
            self.storage[self.write..self.write + n].copy_from_slice(&src[written..written + n]);
            self.write = (self.write + n) % self.capacity;
            written += n;
            self.last_write = true;
        }
        written
    }

    /// copy out of the ring into `dst`. returns bytes produced.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut filled = 0;
        while filled < dst.len() && !self.is_empty() {
            let end = if self.write > self.read { self.write } else { self.capacity };
            let n = (end - self.read).min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&self.storage[self.read..self.read + n]);
            self.read = (self.read + n) % self.capacity;
            filled += n;
            self.last_write = false;
        }
        filled
    }

    /// pop everything buffered as one owned chunk.
    pub fn take_bytes(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        while !self.is_empty() {
            let end = if self.write > self.read { self.write } else { self.capacity };
            out.extend_from_slice(&self.storage[self.read..end]);
            self.read = end % self.capacity;
            self.last_write = false;
        }
        out.freeze()
    }

    /// reclaim the backing storage for pooling.
    pub fn into_storage(self) -> BytesMut {
        self.storage
    }
}

/// build an async producer/consumer pair over a fresh ring.
pub fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
    ring_with_storage(BytesMut::new(), capacity)
}

/// same as [ring] with pooled backing storage.
pub fn ring_with_storage(storage: BytesMut, capacity: usize) -> (RingProducer, RingConsumer) {
    let shared = Rc::new(RefCell::new(Shared {
        ring: RingBuffer::with_storage(storage, capacity),
        err: None,
        consumer_alive: true,
        read_waker: None,
        write_waker: None,
    }));
    (RingProducer(shared.clone()), RingConsumer(Some(shared)))
}

struct Shared {
    ring: RingBuffer,
    err: Option<io::Error>,
    consumer_alive: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Shared {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// data-in half. writes park when the ring is full.
pub struct RingProducer(Rc<RefCell<Shared>>);

impl RingProducer {
    pub fn poll_write(&mut self, cx: &mut Context<'_>, src: &[u8]) -> Poll<io::Result<usize>> {
        let mut shared = self.0.borrow_mut();
        if !shared.consumer_alive {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        debug_assert!(!shared.ring.is_closed(), "write after close");
        let n = shared.ring.write(src);
        if n == 0 {
            shared.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        shared.wake_reader();
        Poll::Ready(Ok(n))
    }

    /// write the whole chunk, yielding for drain room as needed.
    pub async fn write_all(&mut self, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let n = core::future::poll_fn(|cx| self.poll_write(cx, src)).await?;
            src = &src[n..];
        }
        Ok(())
    }

    /// finish the stream cleanly. buffered bytes still drain.
    pub fn close(&mut self) {
        let mut shared = self.0.borrow_mut();
        shared.ring.close();
        shared.wake_reader();
    }

    /// finish the stream with an error surfaced to the consumer after the
    /// buffered bytes.
    pub fn fail(&mut self, e: io::Error) {
        let mut shared = self.0.borrow_mut();
        shared.err = Some(e);
        shared.ring.close();
        shared.wake_reader();
    }

    pub fn is_consumer_alive(&self) -> bool {
        self.0.borrow().consumer_alive
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// data-out half. a [Stream] of the buffered bytes.
pub struct RingConsumer(Option<Rc<RefCell<Shared>>>);

impl RingConsumer {
    /// reclaim storage after eof. None when the producer still holds the pair.
    pub fn try_into_storage(mut self) -> Option<BytesMut> {
        let shared = self.0.take()?;
        match Rc::try_unwrap(shared) {
            Ok(shared) => Some(shared.into_inner().ring.into_storage()),
            Err(shared) => {
                // producer still attached; behave like a plain drop.
                let mut shared = shared.borrow_mut();
                shared.consumer_alive = false;
                shared.wake_writer();
                None
            }
        }
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        if let Some(shared) = self.0.take() {
            let mut shared = shared.borrow_mut();
            shared.consumer_alive = false;
            shared.wake_writer();
        }
    }
}

impl Stream for RingConsumer {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(shared) = this.0.as_ref() else {
            return Poll::Ready(None);
        };
        let mut shared = shared.borrow_mut();
        if !shared.ring.is_empty() {
            let bytes = shared.ring.take_bytes();
            shared.wake_writer();
            return Poll::Ready(Some(Ok(bytes)));
        }
        if shared.ring.is_closed() {
            return match shared.err.take() {
                Some(e) => Poll::Ready(Some(Err(e))),
                None => Poll::Ready(None),
            };
        }
        shared.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use futures_core::Stream;

    use super::*;

    // deterministic pseudo random sizes for the interleaving test.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as usize % bound + 1
        }
    }

    #[test]
    fn interleaved_io_preserves_byte_sequence() {
        let input: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut ring = RingBuffer::new(61);
        let mut rng = Lcg(7);

        let mut written = 0;
        let mut output = Vec::new();
        let mut scratch = [0u8; 97];

        while output.len() < input.len() {
            assert!(!(ring.is_empty() && ring.is_full()));

            let w = rng.next(64);
            written += ring.write(&input[written..(written + w).min(input.len())]);

            let r = rng.next(scratch.len());
            let n = ring.read(&mut scratch[..r]);
            output.extend_from_slice(&scratch[..n]);
        }

        assert_eq!(output, input);
    }

    #[test]
    fn capacity_one_is_always_empty_or_full() {
        let mut ring = RingBuffer::new(1);
        assert!(ring.is_empty());
        assert_eq!(ring.write(b"ab"), 1);
        assert!(ring.is_full());
        assert!(!ring.is_empty());
        let mut byte = [0u8; 1];
        assert_eq!(ring.read(&mut byte), 1);
        assert_eq!(&byte, b"a");
        assert!(ring.is_empty());
    }

    #[test]
    fn close_then_drain_reaches_eof() {
        let mut ring = RingBuffer::new(8);
        ring.write(b"abc");
        ring.close();
        assert!(!ring.is_eof_reached());
        assert_eq!(&ring.take_bytes()[..], b"abc");
        assert!(ring.is_eof_reached());
    }

    #[tokio::test]
    async fn async_pair_pipes_and_backpressures() {
        let (mut tx, mut rx) = ring(4);

        let writer = async move {
            tx.write_all(b"hello ring buffer").await.unwrap();
            tx.close();
        };

        let reader = async move {
            let mut out = Vec::new();
            while let Some(chunk) = core::future::poll_fn(|cx| Pin::new(&mut rx).poll_next(cx)).await {
                out.extend_from_slice(&chunk.unwrap());
            }
            out
        };

        let (_, out) = tokio::join!(writer, reader);
        assert_eq!(out, b"hello ring buffer");
    }
}
