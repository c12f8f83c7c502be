//! backend response body stream.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use std::io;

use futures_core::stream::Stream;
use tokio::time::{sleep_until, Instant, Sleep};

use strand_http::{
    body::exact_body_hint,
    bytes::Bytes,
    h1::proto::codec::{ChunkResult, TransferCoding},
    io::{read_buf, AsyncIo, Interest},
};

use crate::{connection::H1Connection, pool::PoolSlot};

/// body of a backend response.
///
/// owns the pooled transport while streaming. once the decoder reports end of
/// body a still reusable connection slides back into its pool; dropping the
/// body early or hitting an error tears the transport down instead.
pub struct ResponseBody {
    state: Option<State>,
}

struct State {
    conn: H1Connection,
    decoder: TransferCoding,
    slot: PoolSlot,
    reusable: bool,
    read_timeout: Duration,
    timer: Option<Pin<Box<Sleep>>>,
}

impl ResponseBody {
    pub(crate) fn new(
        conn: H1Connection,
        decoder: TransferCoding,
        slot: PoolSlot,
        reusable: bool,
        read_timeout: Duration,
    ) -> Self {
        let state = State {
            conn,
            decoder,
            slot,
            reusable,
            read_timeout,
            timer: None,
        };

        // bodyless response: the exchange is already over, hand the transport
        // back right away.
        if state.decoder.is_eof() {
            state.finish();
            return Self { state: None };
        }

        Self { state: Some(state) }
    }

    /// an empty body that never held a connection.
    pub fn empty() -> Self {
        Self { state: None }
    }
}

impl State {
    // consume the state, returning a still reusable transport to its pool.
    fn finish(self) {
        if self.reusable {
            self.slot.release(self.conn);
        }
    }
}

impl Stream for ResponseBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            let Some(state) = this.state.as_mut() else {
                return Poll::Ready(None);
            };

            match state.decoder.decode(&mut state.conn.read_buf) {
                ChunkResult::Ok(bytes) => {
                    state.timer = None;
                    return Poll::Ready(Some(Ok(bytes)));
                }
                ChunkResult::Eof => {
                    this.state.take().unwrap().finish();
                    return Poll::Ready(None);
                }
                ChunkResult::AlreadyEof => {
                    this.state = None;
                    return Poll::Ready(None);
                }
                ChunkResult::Err(e) => {
                    this.state = None;
                    return Poll::Ready(Some(Err(e)));
                }
                ChunkResult::InsufficientData => match state.conn.io.poll_ready(Interest::READABLE, cx) {
                    Poll::Ready(Ok(_)) => match read_buf(&mut state.conn.io, &mut state.conn.read_buf) {
                        Ok(0) => {
                            // a close delimited body ends exactly here; any
                            // other decoder is owed more bytes.
                            if state.decoder.is_close_delimited() {
                                this.state = None;
                                return Poll::Ready(None);
                            }
                            this.state = None;
                            return Poll::Ready(Some(Err(io::ErrorKind::UnexpectedEof.into())));
                        }
                        Ok(_) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            this.state = None;
                            return Poll::Ready(Some(Err(e)));
                        }
                    },
                    Poll::Ready(Err(e)) => {
                        this.state = None;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Pending => {
                        // park with the stall guard armed.
                        let deadline = Instant::now() + state.read_timeout;
                        let timer = state.timer.get_or_insert_with(|| Box::pin(sleep_until(deadline)));
                        match timer.as_mut().poll(cx) {
                            Poll::Ready(_) => {
                                this.state = None;
                                return Poll::Ready(Some(Err(io::ErrorKind::TimedOut.into())));
                            }
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                },
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.state {
            None => exact_body_hint(0),
            Some(ref state) => match state.decoder {
                TransferCoding::Length(rem) => exact_body_hint(rem as usize),
                _ => (0, None),
            },
        }
    }
}
