//! the client side request/response cycle.

pub(crate) mod proto;

use core::{pin::pin, time::Duration};

use std::io;

use futures_core::stream::Stream;
use tracing::trace;

use strand_http::{
    bytes::{Buf, Bytes, BytesMut},
    error::BodyError,
    http::{request, Method, StatusCode},
    io::{read_buf, AsyncIo, Interest},
};

use crate::{
    connection::H1Connection,
    error::{Error, SendError},
};

use self::proto::DecodedHead;

#[derive(Clone, Copy)]
pub(crate) struct SendOptions {
    pub(crate) continue_timeout: Duration,
    pub(crate) response_timeout: Duration,
    pub(crate) monitor_chunked: bool,
}

/// outcome of one request over an established connection.
pub(crate) struct Exchange {
    pub(crate) head: DecodedHead,
    /// the transport can host another request once the body is drained.
    pub(crate) reusable: bool,
}

/// run one request/response exchange on `conn`.
///
/// the body stream travels back inside the error for every failure that
/// happened before its first chunk was pulled, making those failures safe to
/// retry on another connection.
pub(crate) async fn send<B, E>(
    conn: &mut H1Connection,
    parts: request::Parts,
    body: B,
    opts: SendOptions,
) -> Result<Exchange, SendError<B>>
where
    B: Stream<Item = Result<Bytes, E>>,
    E: Into<BodyError>,
{
    let is_head = parts.method == Method::HEAD;

    let mut buf = BytesMut::new();

    let (mut encoder, expect) = match proto::encode_request(&parts, &body, &mut buf) {
        Ok(res) => res,
        Err(e) => return Err(SendError::new(e.into(), Some(body))),
    };

    if let Err(e) = write_all(&mut conn.io, &mut buf).await {
        return Err(SendError::new(e.into(), Some(body)));
    }

    // with expect set the body is withheld until the backend commits with an
    // interim response. a non-100 answer becomes the final response and the
    // transport is burned since its framing no longer lines up.
    if expect {
        match read_head(conn, opts.continue_timeout, is_head, opts.monitor_chunked, Error::ContinueTimeout).await {
            Ok(head) if head.response.status() == StatusCode::CONTINUE => {
                trace!(target: "h1_client", "backend committed with 100 continue");
            }
            Ok(mut head) => {
                head.keep_alive = false;
                return Ok(Exchange {
                    head,
                    reusable: false,
                });
            }
            Err(e) => return Err(SendError::new(e, Some(body))),
        }
    }

    if !encoder.is_eof() {
        // request body upload. from here on the body is consumed and the
        // request must not be replayed.
        let mut body = pin!(body);
        loop {
            let chunk = match core::future::poll_fn(|cx| body.as_mut().poll_next(cx)).await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(SendError::new(Error::Io(io::Error::other(e.into())), None)),
                None => break,
            };
            encoder.encode(chunk, &mut buf);
            if let Err(e) = write_all(&mut conn.io, &mut buf).await {
                return Err(SendError::new(e.into(), None));
            }
        }
        encoder.encode_eof(&mut buf);
        if let Err(e) = write_all(&mut conn.io, &mut buf).await {
            return Err(SendError::new(e.into(), None));
        }
    }

    // response heads of 1xx interim class are passed over.
    loop {
        match read_head(conn, opts.response_timeout, is_head, opts.monitor_chunked, Error::ResponseTimeout).await {
            Ok(head) if head.response.status().is_informational() => continue,
            Ok(head) => {
                let reusable = head.keep_alive;
                return Ok(Exchange { head, reusable });
            }
            Err(e) => return Err(SendError::new(e, None)),
        }
    }
}

async fn read_head(
    conn: &mut H1Connection,
    timeout: Duration,
    is_head: bool,
    monitor_chunked: bool,
    timeout_error: Error,
) -> Result<DecodedHead, Error> {
    let read = async {
        loop {
            if let Some(head) = proto::decode_response(&mut conn.read_buf, is_head, monitor_chunked)? {
                return Ok(head);
            }

            conn.io.ready(Interest::READABLE).await?;
            match read_buf(&mut conn.io, &mut conn.read_buf) {
                Ok(0) => return Err(Error::ClosedBeforeResponse),
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    };

    tokio::time::timeout(timeout, read).await.map_err(|_| timeout_error)?
}

pub(crate) async fn write_all(io: &mut strand_http::io::TcpStream, buf: &mut BytesMut) -> io::Result<()> {
    while !buf.is_empty() {
        io.ready(Interest::WRITABLE).await?;

        match io::Write::write(io, buf.chunk()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
