//! tls termination over the readiness io model, backed by rustls.
//!
//! the handshake is driven by plain readiness loops over the inner transport;
//! once it completes the stream behaves like any other [AsyncIo] and the h1
//! dispatcher stays unaware of the encryption underneath.

use core::{
    cell::RefCell,
    fmt,
    future::{poll_fn, Future},
    pin::Pin,
    task::{ready, Context, Poll},
};

use std::{io, sync::Arc};

use rustls::{ServerConnection, ServerConfig};

use crate::io::{AsyncIo, Interest, Ready};

// plaintext the session may buffer before writers are pushed back.
const SESSION_BUF_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
pub enum TlsError {
    Io(io::Error),
    Rustls(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Io(ref e) => fmt::Display::fmt(e, f),
            Self::Rustls(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<io::Error> for TlsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        Self::Rustls(e)
    }
}

/// server side tls transport over any [AsyncIo].
pub struct TlsStream<Io> {
    inner: RefCell<Inner<Io>>,
}

struct Inner<Io> {
    io: Io,
    session: ServerConnection,
    close_sent: bool,
}

impl<Io> TlsStream<Io>
where
    Io: AsyncIo,
{
    /// perform the server handshake on a fresh connection.
    pub async fn accept(mut io: Io, config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let mut session = ServerConnection::new(config)?;
        session.set_buffer_limit(Some(SESSION_BUF_LIMIT));

        while session.is_handshaking() {
            // drain pending handshake records first. they carry the flights of
            // the negotiation.
            while session.wants_write() {
                match session.write_tls(&mut io) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        io.ready(Interest::WRITABLE).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if !session.is_handshaking() {
                break;
            }

            match session.read_tls(&mut io) {
                // peer went away mid handshake.
                Ok(0) => return Err(TlsError::Io(io::ErrorKind::UnexpectedEof.into())),
                Ok(_) => {
                    session.process_new_packets().map_err(|e| {
                        // a fatal alert may be pending; best effort send.
                        let _ = session.write_tls(&mut io);
                        TlsError::from(e)
                    })?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    io.ready(Interest::READABLE).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // flush the final flight.
        while session.wants_write() {
            match session.write_tls(&mut io) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    io.ready(Interest::WRITABLE).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Self {
            inner: RefCell::new(Inner {
                io,
                session,
                close_sent: false,
            }),
        })
    }
}

impl<Io> Inner<Io>
where
    Io: io::Read + io::Write,
{
    fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match io::Read::read(&mut self.session.reader(), buf) {
                // clean close_notify from the peer.
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // session starved; pull more records off the wire.
                    match self.session.read_tls(&mut self.io) {
                        Ok(0) => return Ok(0),
                        Ok(_) => {
                            self.session
                                .process_new_packets()
                                .map_err(|e| io::Error::other(TlsError::from(e)))?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_plain(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = io::Write::write(&mut self.session.writer(), buf)?;
        // push encrypted records out opportunistically; backpressure shows up
        // through the session buffer limit instead of this write call.
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.io) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn flush_plain(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.session.writer())?;
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.io) {
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        io::Write::flush(&mut self.io)
    }
}

impl<Io> AsyncIo for TlsStream<Io>
where
    Io: AsyncIo,
{
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        poll_fn(move |cx| self.inner.get_mut().io.poll_ready(interest, cx))
    }

    fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        self.inner.get_mut().io.poll_ready(interest, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let inner = self.get_mut().inner.get_mut();

        if !inner.close_sent {
            inner.session.send_close_notify();
            inner.close_sent = true;
        }

        while inner.session.wants_write() {
            match inner.session.write_tls(&mut inner.io) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready!(inner.io.poll_ready(Interest::WRITABLE, cx))?;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }

        Pin::new(&mut inner.io).poll_shutdown(cx)
    }
}

impl<Io> AsyncIo for &TlsStream<Io>
where
    Io: AsyncIo,
    for<'i> &'i Io: AsyncIo,
{
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
        poll_fn(move |cx| AsyncIo::poll_ready(self, interest, cx))
    }

    fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
        let inner = self.inner.borrow();
        let mut io = &inner.io;
        io.poll_ready(interest, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("shutdown through shared reference is not supported")))
    }
}

impl<Io> io::Read for TlsStream<Io>
where
    Io: io::Read + io::Write,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.get_mut().read_plain(buf)
    }
}

impl<Io> io::Write for TlsStream<Io>
where
    Io: io::Read + io::Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.get_mut().write_plain(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush_plain()
    }
}

impl<Io> io::Read for &TlsStream<Io>
where
    for<'i> &'i Io: io::Read + io::Write,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        read_shared(&mut inner, buf)
    }
}

impl<Io> io::Write for &TlsStream<Io>
where
    for<'i> &'i Io: io::Read + io::Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        write_shared(&mut inner, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        flush_shared(&mut inner)
    }
}

// shared reference variants route io calls through &Io.
fn read_shared<Io>(inner: &mut Inner<Io>, buf: &mut [u8]) -> io::Result<usize>
where
    for<'i> &'i Io: io::Read + io::Write,
{
    loop {
        match io::Read::read(&mut inner.session.reader(), buf) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let mut io = &inner.io;
                match inner.session.read_tls(&mut io) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        inner
                            .session
                            .process_new_packets()
                            .map_err(|e| io::Error::other(TlsError::from(e)))?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_shared<Io>(inner: &mut Inner<Io>, buf: &[u8]) -> io::Result<usize>
where
    for<'i> &'i Io: io::Read + io::Write,
{
    let n = io::Write::write(&mut inner.session.writer(), buf)?;
    while inner.session.wants_write() {
        let mut io = &inner.io;
        match inner.session.write_tls(&mut io) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    if n == 0 && !buf.is_empty() {
        return Err(io::ErrorKind::WouldBlock.into());
    }
    Ok(n)
}

fn flush_shared<Io>(inner: &mut Inner<Io>) -> io::Result<()>
where
    for<'i> &'i Io: io::Read + io::Write,
{
    io::Write::flush(&mut inner.session.writer())?;
    while inner.session.wants_write() {
        let mut io = &inner.io;
        match inner.session.write_tls(&mut io) {
            Ok(_) => {}
            Err(e) => return Err(e),
        }
    }
    let mut io = &inner.io;
    io::Write::flush(&mut io)
}
