//! file backed buffers: a windowed chunk reader serving a file as a body
//! stream and a bounded sink writing a body stream out to a file.

use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use std::io::{self, SeekFrom};

use futures_core::stream::Stream;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    body::exact_body_hint,
    bytes::{Bytes, BytesMut},
};

/// default read window.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

type ChunkFuture = Pin<Box<dyn Future<Output = io::Result<(File, BytesMut, usize)>>>>;

/// stream of a file region as body chunks. one read window is in flight at a
/// time and the next is only issued once the consumer takes the previous chunk,
/// so downstream demand paces file io.
pub struct FileChunkReader {
    chunk_size: usize,
    remaining: u64,
    on_flight: ChunkFuture,
}

/// serve `len` bytes of `file` starting at `offset`.
pub fn chunk_read(mut file: File, offset: u64, len: u64, chunk_size: usize) -> FileChunkReader {
    let buf = BytesMut::with_capacity(chunk_size);
    FileChunkReader {
        chunk_size,
        remaining: len,
        on_flight: Box::pin(async move {
            if offset > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
            }
            next_chunk(file, buf).await
        }),
    }
}

async fn next_chunk(mut file: File, mut buf: BytesMut) -> io::Result<(File, BytesMut, usize)> {
    let n = file.read_buf(&mut buf).await?;
    Ok((file, buf, n))
}

impl Stream for FileChunkReader {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.remaining == 0 {
            return Poll::Ready(None);
        }

        let (file, mut buf, n) = match ready!(this.on_flight.as_mut().poll(cx)) {
            Ok(res) => res,
            Err(e) => {
                this.remaining = 0;
                return Poll::Ready(Some(Err(e)));
            }
        };

        if n == 0 {
            // file shrank under us. the promised window can not be served.
            this.remaining = 0;
            return Poll::Ready(Some(Err(io::ErrorKind::UnexpectedEof.into())));
        }

        let mut chunk = buf.split_to(n);

        if this.remaining <= n as u64 {
            // someone may have appended past the promised window; serve exactly
            // the bytes promised.
            chunk.truncate(this.remaining as usize);
            this.remaining = 0;
            return Poll::Ready(Some(Ok(chunk.freeze())));
        }

        this.remaining -= n as u64;
        buf.reserve(this.chunk_size);
        this.on_flight = Box::pin(next_chunk(file, buf));

        Poll::Ready(Some(Ok(chunk.freeze())))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        exact_body_hint(self.remaining as usize)
    }
}

/// bounded file writer.
///
/// the first write failure (or crossing `max` bytes) is recorded and every
/// later write turns into a cheap drain, so the producing stream keeps flowing
/// toward its other consumers while the file is abandoned.
pub struct FileSink {
    file: File,
    max: u64,
    written: u64,
    err: Option<io::Error>,
}

impl FileSink {
    pub fn new(file: File, max: u64) -> Self {
        Self {
            file,
            max,
            written: 0,
            err: None,
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) {
        if self.err.is_some() {
            return;
        }
        if self.written + chunk.len() as u64 > self.max {
            self.err = Some(io::Error::other("file sink byte allowance exceeded"));
            return;
        }
        match self.file.write_all(chunk).await {
            Ok(_) => self.written += chunk.len() as u64,
            Err(e) => self.err = Some(e),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn error(&self) -> Option<&io::Error> {
        self.err.as_ref()
    }

    /// flush and hand the file back, or surface the recorded failure.
    pub async fn finish(mut self) -> io::Result<File> {
        if let Some(e) = self.err.take() {
            return Err(e);
        }
        self.file.flush().await?;
        Ok(self.file)
    }
}

#[cfg(test)]
mod test {
    use core::future::poll_fn;

    use std::io::Write;

    use super::*;

    async fn drain(mut reader: FileChunkReader) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = poll_fn(|cx| Pin::new(&mut reader).poll_next(cx)).await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn chunk_reader_serves_window() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();

        let file = File::open(tmp.path()).await.unwrap();
        let out = drain(chunk_read(file, 0, 10, 4)).await;
        assert_eq!(out, b"0123456789");

        let file = File::open(tmp.path()).await.unwrap();
        let out = drain(chunk_read(file, 2, 5, 2)).await;
        assert_eq!(out, b"23456");
    }

    #[tokio::test]
    async fn sink_records_first_error_and_keeps_draining() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = File::create(tmp.path()).await.unwrap();

        let mut sink = FileSink::new(file, 4);
        sink.write(b"abcd").await;
        assert!(sink.error().is_none());

        sink.write(b"e").await;
        assert!(sink.error().is_some());

        // draining writes after the failure are accepted silently.
        sink.write(b"fgh").await;
        assert_eq!(sink.bytes_written(), 4);
        assert!(sink.finish().await.is_err());
    }

    #[tokio::test]
    async fn sink_finish_flushes() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = File::create(tmp.path()).await.unwrap();

        let mut sink = FileSink::new(file, 1024);
        sink.write(b"hello").await;
        sink.finish().await.unwrap();

        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"hello");
    }
}
