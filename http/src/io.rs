//! readiness based io abstraction.
//!
//! strand drives sockets edge style: attempt the syscall, treat `WouldBlock` as
//! loss of readiness and park on [AsyncIo::ready] until the kernel reports the
//! interest again. the trait is implemented for shared references as well so a
//! request body reader and the dispatcher can both hold the same connection.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use std::{io, net::SocketAddr};

pub use tokio::io::{Interest, Ready};

/// A readiness probing io type that also exposes non blocking [io::Read] and
/// [io::Write].
pub trait AsyncIo: io::Read + io::Write + Unpin {
    /// asynchronously wait for the io and return its state as [Ready].
    ///
    /// # Errors:
    ///
    /// the only error cause of ready should be from runtime shutdown. actual io
    /// errors are exposed from the [io::Read]/[io::Write] methods.
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>>;

    /// a poll version of the ready method.
    fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>>;

    /// poll shutdown the write part of Self.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

/// tcp connection adapter between tokio's net type and [AsyncIo].
#[derive(Debug)]
pub struct TcpStream(tokio::net::TcpStream);

impl TcpStream {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self(stream)
    }

    /// accept side constructor. disables Nagle so responses coalesced by the
    /// dispatcher write buffer leave in one packet.
    pub fn accepted(stream: tokio::net::TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self(stream))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }

    pub fn into_inner(self) -> tokio::net::TcpStream {
        self.0
    }
}

impl AsyncIo for TcpStream {
    #[inline]
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        self.0.ready(interest)
    }

    #[inline]
    fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        poll_ready_tcp(&self.0, interest, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
    }
}

impl AsyncIo for &TcpStream {
    #[inline]
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        self.0.ready(interest)
    }

    #[inline]
    fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        poll_ready_tcp(&self.0, interest, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("shutdown through shared reference is not supported")))
    }
}

fn poll_ready_tcp(stream: &tokio::net::TcpStream, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
    if interest.is_readable() {
        stream.poll_read_ready(cx).map_ok(|_| Ready::READABLE)
    } else {
        stream.poll_write_ready(cx).map_ok(|_| Ready::WRITABLE)
    }
}

impl io::Read for TcpStream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for TcpStream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for &TcpStream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for &TcpStream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// read chunk size of a single io attempt.
const READ_BATCH: usize = 4096;

/// read from io into the back of `buf` until the kernel runs dry.
/// return the byte count read. `Ok(0)` only occurs on read closed.
/// the first failed attempt surfaces as `WouldBlock` so the caller can park on
/// readiness; a later one terminates the batch with the bytes gathered so far.
pub fn read_buf<Io>(io: &mut Io, buf: &mut bytes::BytesMut) -> io::Result<usize>
where
    Io: io::Read,
{
    let mut chunk = [0u8; READ_BATCH];
    let mut total = 0;
    loop {
        match io.read(&mut chunk) {
            Ok(0) if total == 0 => return Ok(0),
            Ok(0) => return Ok(total),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                total += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock && total != 0 => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}
