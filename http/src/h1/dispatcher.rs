use core::{
    cell::RefCell,
    future::{poll_fn, Future},
    mem,
    pin::{pin, Pin},
    task::{ready, Poll, Waker},
    time::Duration,
};

use std::{io, net::SocketAddr, rc::Rc};

use futures_core::stream::Stream;
use pin_project_lite::pin_project;
use tracing::trace;

use crate::{
    body::{FlushNotice, NoneBody},
    bytes::{Buf, Bytes, BytesMut},
    config::HttpServiceConfig,
    date::DateTime,
    http::{response::Response, Request, StatusCode},
    io::{read_buf, AsyncIo, Interest},
    service::Service,
    util::timer::{Deadline, Timeout},
    ResponseBody,
};

use super::{
    body::RequestBody,
    error::Error,
    proto::{
        codec::{ChunkResult, TransferCoding},
        context::Context,
        encode::CONTINUE_BYTES,
    },
};

/// drive one accepted connection through its request/response cycles until
/// close or error.
pub(crate) async fn run<'a, Io, S, D, const H_LIMIT: usize, const R_LIMIT: usize, const W_LIMIT: usize>(
    io: Io,
    addr: SocketAddr,
    is_tls: bool,
    timer: Pin<&'a mut Deadline>,
    write_timer: Pin<&'a mut Deadline>,
    config: HttpServiceConfig<H_LIMIT, R_LIMIT, W_LIMIT>,
    service: &'a S,
    date: &'a D,
) -> Result<(), Error<S::Error>>
where
    Io: AsyncIo + 'static,
    for<'i> &'i Io: AsyncIo,
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    D: DateTime,
{
    let mut dispatcher = Dispatcher::<_, _, _, H_LIMIT, R_LIMIT, W_LIMIT> {
        io: Rc::new(io),
        timer: Timer::new(timer, config.keep_alive_timeout, config.request_head_timeout),
        write_timer,
        write_dur: config.write_timeout,
        ctx: Context::with_addr(addr, date, is_tls),
        service,
        read_buf: BytesMut::new(),
        write_buf: BytesMut::new(),
        notify: Notify::new(),
    };

    loop {
        match dispatcher._run().await {
            Ok(_) => {}
            Err(Error::KeepAliveExpire) => {
                trace!(
                    target: "h1_dispatcher",
                    requests = dispatcher.ctx.request_count(),
                    "connection keep-alive expired. shutting down"
                );
                dispatcher.ctx.set_close();
            }
            Err(Error::RequestTimeout) => dispatcher.request_error(|| status_only(StatusCode::REQUEST_TIMEOUT)),
            // an oversized head is answered like any malformed one, with the
            // connection marked for close.
            Err(Error::Proto(_)) => dispatcher.request_error(|| status_only(StatusCode::BAD_REQUEST)),
            Err(e) => return Err(e),
        }

        flush_timed(
            &*dispatcher.io,
            &mut dispatcher.write_buf,
            dispatcher.write_timer.as_mut(),
            dispatcher.ctx.date().now() + dispatcher.write_dur,
        )
        .await?;

        if dispatcher.ctx.is_connection_closed() {
            let io = Rc::try_unwrap(dispatcher.io)
                .ok()
                .expect("dispatcher must have exclusive ownership of Io when closing connection");
            let mut io = pin!(io);
            return poll_fn(|cx| io.as_mut().poll_shutdown(cx)).await.map_err(Into::into);
        }
    }
}

// timer state transforms in the following order:
//
// Idle (expecting keep-alive duration)           <--
//  |                                               |
//  --> Wait (expecting request head duration)      |
//       |                                          |
//       --> Throttle (expecting manual reset to Idle)
enum TimerState {
    Idle,
    Wait,
    Throttle,
}

struct Timer<'a> {
    timer: Pin<&'a mut Deadline>,
    state: TimerState,
    ka_dur: Duration,
    req_dur: Duration,
}

impl<'a> Timer<'a> {
    fn new(timer: Pin<&'a mut Deadline>, ka_dur: Duration, req_dur: Duration) -> Self {
        Self {
            timer,
            state: TimerState::Idle,
            ka_dur,
            req_dur,
        }
    }

    fn reset_state(&mut self) {
        self.state = TimerState::Idle;
    }

    fn get(&mut self) -> Pin<&mut Deadline> {
        self.timer.as_mut()
    }

    // move the deadline forward from the given now sample.
    fn update(&mut self, now: tokio::time::Instant) {
        let dur = match self.state {
            TimerState::Idle => {
                self.state = TimerState::Wait;
                self.ka_dur
            }
            TimerState::Wait => {
                self.state = TimerState::Throttle;
                self.req_dur
            }
            TimerState::Throttle => return,
        };
        self.timer.as_mut().update(now + dur)
    }

    #[cold]
    #[inline(never)]
    fn map_to_err<SE>(&self) -> Error<SE> {
        match self.state {
            TimerState::Wait => Error::KeepAliveExpire,
            TimerState::Throttle => Error::RequestTimeout,
            TimerState::Idle => unreachable!(),
        }
    }
}

#[cold]
#[inline(never)]
fn status_only(status: StatusCode) -> Response<NoneBody<Bytes>> {
    Response::builder().status(status).body(NoneBody::default()).unwrap()
}

struct Dispatcher<'a, Io, S, D, const H_LIMIT: usize, const R_LIMIT: usize, const W_LIMIT: usize> {
    io: Rc<Io>,
    timer: Timer<'a>,
    write_timer: Pin<&'a mut Deadline>,
    write_dur: Duration,
    ctx: Context<'a, D, H_LIMIT>,
    service: &'a S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    notify: Notify<BytesMut>,
}

impl<'a, Io, S, D, const H_LIMIT: usize, const R_LIMIT: usize, const W_LIMIT: usize>
    Dispatcher<'a, Io, S, D, H_LIMIT, R_LIMIT, W_LIMIT>
where
    Io: AsyncIo + 'static,
    for<'i> &'i Io: AsyncIo,
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    D: DateTime,
{
    async fn _run(&mut self) -> Result<(), Error<S::Error>> {
        self.timer.update(self.ctx.date().now());

        let n = read_io(&*self.io, &mut self.read_buf)
            .timeout(self.timer.get())
            .await
            .map_err(|_| self.timer.map_to_err())??;

        if n == 0 {
            self.ctx.set_close();
            return Ok(());
        }

        while let Some((req, decoder)) = self.ctx.decode_head::<R_LIMIT>(&mut self.read_buf)? {
            self.timer.reset_state();
            self.ctx.inc_request_count();

            let (waiter, body) = if decoder.is_eof() {
                (None, RequestBody::default())
            } else {
                let body = make_body::<_, R_LIMIT>(
                    self.io.clone(),
                    self.ctx.is_expect_header(),
                    decoder,
                    mem::take(&mut self.read_buf),
                    self.notify.notifier(),
                );

                (Some(&mut self.notify), body)
            };

            let req = req.map(|_| body);

            let (mut parts, body) = self.service.call(req).await.map_err(Error::Service)?.into_parts();

            // a delivery notice rides along when a body producer needs to know
            // its bytes reached the transport. fired after the final flush.
            let flush_notice = parts.extensions.remove::<FlushNotice>();

            let mut encoder = self.ctx.encode_head(parts, &body, &mut self.write_buf)?;

            // this block is necessary: the response body may hold the request
            // body reader alive, and it must drop before the waiter is polled
            // or the read buffer would never be returned.
            {
                let mut body = pin!(body);

                loop {
                    let buf = &mut self.write_buf;

                    let res = poll_fn(|cx| match body.as_mut().poll_next(cx) {
                        Poll::Ready(res) => Poll::Ready(Some(res)),
                        Poll::Pending if buf.is_empty() => Poll::Pending,
                        // io can make progress while the body is starved.
                        Poll::Pending => Poll::Ready(None),
                    })
                    .await;

                    match res {
                        Some(Some(Ok(bytes))) => {
                            encoder.encode(bytes, buf);
                            if buf.len() < W_LIMIT {
                                continue;
                            }
                        }
                        Some(Some(Err(e))) => {
                            flush_timed(
                                &*self.io,
                                &mut self.write_buf,
                                self.write_timer.as_mut(),
                                self.ctx.date().now() + self.write_dur,
                            )
                            .await?;
                            return Err(Error::Body(e));
                        }
                        Some(None) => break encoder.encode_eof(buf),
                        None => {}
                    }

                    flush_timed(
                        &*self.io,
                        &mut self.write_buf,
                        self.write_timer.as_mut(),
                        self.ctx.date().now() + self.write_dur,
                    )
                    .await?;
                }
            }

            if let Some(notice) = flush_notice {
                // push the response's tail out before reporting delivery; the
                // usual lazy flush would fire the notice too early.
                flush_timed(
                    &*self.io,
                    &mut self.write_buf,
                    self.write_timer.as_mut(),
                    self.ctx.date().now() + self.write_dur,
                )
                .await?;
                notice.notify();
            }

            if let Some(waiter) = waiter {
                match waiter.wait().await {
                    Some(read_buf) => self.read_buf = read_buf,
                    None => {
                        // request body reader was dropped with bytes possibly
                        // unread. the transport can not be reused.
                        self.ctx.set_close();
                        break;
                    }
                }
            }

            if self.ctx.is_connection_closed() {
                break;
            }
        }

        Ok(())
    }

    #[cold]
    #[inline(never)]
    fn request_error(&mut self, func: impl FnOnce() -> Response<NoneBody<Bytes>>) {
        self.ctx.set_close();
        let (parts, body) = func().into_parts();
        self.ctx
            .encode_head(parts, &body, &mut self.write_buf)
            .expect("request_error response must encode");
    }
}

// flush `buf` to io with the write deadline armed. a free function so it can
// run while the dispatcher's notify field stays mutably borrowed by the body
// waiter.
async fn flush_timed<Io, S>(
    io: Io,
    buf: &mut BytesMut,
    mut timer: Pin<&mut Deadline>,
    deadline: tokio::time::Instant,
) -> Result<(), Error<S>>
where
    Io: AsyncIo,
{
    if buf.is_empty() {
        return Ok(());
    }
    timer.as_mut().update(deadline);
    write_io(io, buf)
        .timeout(timer)
        .await
        .map_err(|_| Error::WriteTimeout)??;
    Ok(())
}

async fn read_io(mut io: impl AsyncIo, buf: &mut BytesMut) -> io::Result<usize> {
    loop {
        io.ready(Interest::READABLE).await?;

        match read_buf(&mut io, buf) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
}

async fn write_io(mut io: impl AsyncIo, mut buf: impl Buf) -> io::Result<()> {
    while !buf.chunk().is_empty() {
        io.ready(Interest::WRITABLE).await?;

        match io::Write::write(&mut io, buf.chunk()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }

    while let Err(e) = io::Write::flush(&mut io) {
        match e.kind() {
            io::ErrorKind::WouldBlock => {
                io.ready(Interest::WRITABLE).await?;
            }
            _ => return Err(e),
        }
    }

    Ok(())
}

fn make_body<Io, const LIMIT: usize>(
    io: Rc<Io>,
    is_expect: bool,
    decoder: TransferCoding,
    read_buf: BytesMut,
    notify: Notifier<BytesMut>,
) -> RequestBody
where
    Io: 'static,
    for<'i> &'i Io: AsyncIo,
{
    let body = BodyInner {
        io,
        decoder: Decoder {
            decoder,
            limit: LIMIT,
            read_buf,
            notify,
        },
    };

    let state = if is_expect {
        // interim response goes straight to the socket so it precedes any
        // buffered response bytes.
        State::ExpectWrite {
            fut: async { write_io(&*body.io, CONTINUE_BYTES).await.map(|_| body) },
        }
    } else {
        State::Body { body }
    };

    RequestBody::new(BodyReader { state })
}

pin_project! {
    #[project = StateProj]
    #[project_replace = StateProjReplace]
    enum State<Io, FutE> {
        Body {
            body: BodyInner<Io>
        },
        ExpectWrite {
            #[pin]
            fut: FutE,
        },
    }
}

pin_project! {
    struct BodyReader<Io, FutE> {
        #[pin]
        state: State<Io, FutE>
    }
}

struct BodyInner<Io> {
    io: Rc<Io>,
    decoder: Decoder,
}

impl<Io, FutE> Stream for BodyReader<Io, FutE>
where
    for<'i> &'i Io: AsyncIo,
    FutE: Future<Output = io::Result<BodyInner<Io>>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut core::task::Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match this.state.as_mut().project() {
                StateProj::Body { body } => {
                    match body.decoder.decoder.decode(&mut body.decoder.read_buf) {
                        ChunkResult::Ok(bytes) => return Poll::Ready(Some(Ok(bytes))),
                        ChunkResult::Err(e) => return Poll::Ready(Some(Err(e))),
                        ChunkResult::InsufficientData => {
                            if body.decoder.read_buf.len() > body.decoder.limit {
                                let msg = format!(
                                    "READ_BUF_LIMIT reached: {{ limit: {}, length: {} }}",
                                    body.decoder.limit,
                                    body.decoder.read_buf.len()
                                );
                                return Poll::Ready(Some(Err(io::Error::other(msg))));
                            }
                        }
                        _ => return Poll::Ready(None),
                    };

                    let mut io = &*body.io;
                    ready!(io.poll_ready(Interest::READABLE, cx))?;

                    match read_buf(&mut io, &mut body.decoder.read_buf) {
                        // peer closed with body bytes still owed.
                        Ok(0) => return Poll::Ready(Some(Err(io::ErrorKind::UnexpectedEof.into()))),
                        Ok(_) => {}
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
                StateProj::ExpectWrite { fut } => {
                    let body = ready!(fut.poll(cx))?;
                    this.state.as_mut().project_replace(State::Body { body });
                }
            }
        }
    }
}

struct Decoder {
    decoder: TransferCoding,
    limit: usize,
    read_buf: BytesMut,
    notify: Notifier<BytesMut>,
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if self.decoder.is_eof() {
            let buf = mem::take(&mut self.read_buf);
            self.notify.notify(buf);
        }
    }
}

struct Notify<T>(Rc<RefCell<NotifyInner<T>>>);

impl<T> Notify<T> {
    fn new() -> Self {
        Self(Rc::new(RefCell::new(NotifyInner { waker: None, val: None })))
    }

    fn notifier(&mut self) -> Notifier<T> {
        Notifier(self.0.clone())
    }

    fn wait(&mut self) -> impl Future<Output = Option<T>> + '_ {
        poll_fn(|cx| {
            let mut inner = self.0.borrow_mut();
            if let Some(val) = inner.val.take() {
                return Poll::Ready(Some(val));
            } else if Rc::strong_count(&self.0) == 1 {
                return Poll::Ready(None);
            }
            inner.waker = Some(cx.waker().clone());
            Poll::Pending
        })
    }
}

struct Notifier<T>(Rc<RefCell<NotifyInner<T>>>);

impl<T> Drop for Notifier<T> {
    fn drop(&mut self) {
        if let Some(waker) = self.0.borrow_mut().waker.take() {
            waker.wake();
        }
    }
}

impl<T> Notifier<T> {
    fn notify(&mut self, val: T) {
        self.0.borrow_mut().val = Some(val);
    }
}

struct NotifyInner<V> {
    waker: Option<Waker>,
    val: Option<V>,
}

#[cfg(test)]
pub(crate) mod mock {
    //! in memory [AsyncIo] with scripted input for wire level tests.

    use core::task::Context;

    use std::collections::VecDeque;

    use crate::io::Ready;

    use super::*;

    #[derive(Default)]
    struct MockInner {
        incoming: VecDeque<Bytes>,
        out: Vec<u8>,
        read_closed: bool,
        shutdown: bool,
        read_waker: Option<Waker>,
    }

    pub(crate) struct MockIo(Rc<RefCell<MockInner>>);

    /// test side handle feeding input and observing output.
    #[derive(Clone)]
    pub(crate) struct MockHandle(Rc<RefCell<MockInner>>);

    pub(crate) fn mock_io() -> (MockIo, MockHandle) {
        let inner = Rc::new(RefCell::new(MockInner::default()));
        (MockIo(inner.clone()), MockHandle(inner))
    }

    impl MockHandle {
        pub(crate) fn push(&self, bytes: &[u8]) {
            let mut inner = self.0.borrow_mut();
            inner.incoming.push_back(Bytes::copy_from_slice(bytes));
            if let Some(waker) = inner.read_waker.take() {
                waker.wake();
            }
        }

        pub(crate) fn close_read(&self) {
            let mut inner = self.0.borrow_mut();
            inner.read_closed = true;
            if let Some(waker) = inner.read_waker.take() {
                waker.wake();
            }
        }

        pub(crate) fn out(&self) -> Vec<u8> {
            self.0.borrow().out.clone()
        }

        pub(crate) fn is_shutdown(&self) -> bool {
            self.0.borrow().shutdown
        }
    }

    impl AsyncIo for &MockIo {
        fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
            let inner = self.0.clone();
            poll_fn(move |cx| {
                if interest.is_writable() {
                    return Poll::Ready(Ok(Ready::WRITABLE));
                }
                let mut inner = inner.borrow_mut();
                if !inner.incoming.is_empty() || inner.read_closed {
                    Poll::Ready(Ok(Ready::READABLE))
                } else {
                    inner.read_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            })
        }

        fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
            if interest.is_writable() {
                return Poll::Ready(Ok(Ready::WRITABLE));
            }
            let mut inner = self.0.borrow_mut();
            if !inner.incoming.is_empty() || inner.read_closed {
                Poll::Ready(Ok(Ready::READABLE))
            } else {
                inner.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.0.borrow_mut().shutdown = true;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncIo for MockIo {
        fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<Ready>> {
            let mut this = &*self;
            async move { this.ready(interest).await }
        }

        fn poll_ready(&mut self, interest: Interest, cx: &mut Context<'_>) -> Poll<io::Result<Ready>> {
            (&*self).poll_ready(interest, cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut &*self.get_mut()).poll_shutdown(cx)
        }
    }

    impl io::Read for &MockIo {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.0.borrow_mut();
            match inner.incoming.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        chunk.advance(n);
                        inner.incoming.push_front(chunk);
                    }
                    Ok(n)
                }
                None if inner.read_closed => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl io::Write for &MockIo {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().out.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl io::Read for MockIo {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            (&*self).read(buf)
        }
    }

    impl io::Write for MockIo {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            (&*self).write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            (&*self).flush()
        }
    }
}
