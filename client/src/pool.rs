//! per backend pool of reusable keep-alive connections.

use core::{
    cell::{Cell, RefCell},
    time::Duration,
};

use std::{collections::VecDeque, rc::Rc};

use tokio::time::Instant;
use tracing::{debug, trace};

use futures_core::stream::Stream;

use strand_http::{
    bytes::Bytes,
    error::BodyError,
    http::{request, Response},
};

use crate::{
    body::ResponseBody,
    connect,
    connection::H1Connection,
    error::{Error, SendError},
    h1::{self, SendOptions},
};

// rolling window of backend clock offset samples.
const TIME_DELTA_SAMPLES: usize = 16;

#[derive(Clone, Copy)]
pub struct PoolConfig {
    /// bound on establishing a fresh backend connection.
    pub connect_timeout: Duration,
    /// bound on the response head after the request went out.
    pub response_timeout: Duration,
    /// bound on progress while streaming the response body.
    pub read_timeout: Duration,
    /// how long to wait for `100 Continue` before giving up on the attempt.
    pub continue_timeout: Duration,
    /// idle pooled connections past this age are discarded.
    pub idle_timeout: Duration,
    /// hard cap of concurrent connections to this backend.
    pub max_connections: usize,
    /// requests served per connection before it is retired.
    pub max_requests_per_conn: usize,
    /// receive chunked response bodies without re-framing them.
    pub monitor_chunked: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            continue_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(60),
            max_connections: 256,
            max_requests_per_conn: usize::MAX,
            monitor_chunked: false,
        }
    }
}

/// connection pool of one backend. cheap to clone; clones share state.
pub struct ConnectionPool {
    addr: Rc<str>,
    inner: Rc<RefCell<PoolInner>>,
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr.clone(),
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    idle: VecDeque<IdleConn>,
    // lives outside the refcell: tickets decrement it from drop glue, which
    // may run while the pool is borrowed.
    conn_count: Rc<Cell<usize>>,
    deltas: TimeDeltas,
}

struct IdleConn {
    conn: H1Connection,
    ticket: ConnTicket,
    idle_since: Instant,
}

#[derive(Default)]
struct TimeDeltas {
    samples: [i64; TIME_DELTA_SAMPLES],
    len: usize,
    next: usize,
}

impl TimeDeltas {
    fn push(&mut self, sample: i64) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % TIME_DELTA_SAMPLES;
        self.len = (self.len + 1).min(TIME_DELTA_SAMPLES);
    }

    fn mean(&self) -> i64 {
        if self.len == 0 {
            return 0;
        }
        self.samples[..self.len].iter().sum::<i64>() / self.len as i64
    }
}

// drops decrement the owning pool's connection counter, so a connection can
// die anywhere (send failure, body drop, gc) without unbalancing it.
struct ConnTicket {
    count: Rc<Cell<usize>>,
}

impl Drop for ConnTicket {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
    }
}

impl ConnectionPool {
    pub fn new(addr: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            addr: Rc::from(addr.into()),
            inner: Rc::new(RefCell::new(PoolInner {
                config,
                idle: VecDeque::new(),
                conn_count: Rc::new(Cell::new(0)),
                deltas: TimeDeltas::default(),
            })),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// pop a live pooled connection or dial a fresh one.
    pub async fn acquire(&self) -> Result<PooledConnection, Error> {
        let (config, reuse) = {
            let mut inner = self.inner.borrow_mut();
            let config = inner.config;

            let mut reuse = None;
            while let Some(entry) = inner.idle.pop_front() {
                if entry.idle_since.elapsed() < config.idle_timeout {
                    trace!(target: "ppool", addr = %self.addr, "reusing pooled connection");
                    reuse = Some(entry);
                    break;
                }
                // expired entry; its ticket drop releases the slot.
                drop(entry);
            }

            if reuse.is_none() {
                if inner.conn_count.get() >= config.max_connections {
                    return Err(Error::PoolExhausted);
                }
                inner.conn_count.set(inner.conn_count.get() + 1);
            }

            (config, reuse)
        };

        if let Some(IdleConn { conn, ticket, .. }) = reuse {
            return Ok(PooledConnection {
                conn,
                ticket,
                inner: self.inner.clone(),
                config,
                reused: true,
            });
        }

        let ticket = ConnTicket {
            count: self.inner.borrow().conn_count.clone(),
        };

        let io = connect::connect(&self.addr, config.connect_timeout).await?;

        Ok(PooledConnection {
            conn: H1Connection::new(io),
            ticket,
            inner: self.inner.clone(),
            config,
            reused: false,
        })
    }

    /// record one backend-vs-local clock offset sample.
    pub fn report_time_delta(&self, delta_secs: i64) {
        self.inner.borrow_mut().deltas.push(delta_secs);
    }

    /// smoothed backend clock offset.
    pub fn time_delta(&self) -> i64 {
        self.inner.borrow().deltas.mean()
    }

    /// drop idle connections past their allowance. wired to the worker gc tick.
    pub fn gc(&self) {
        let mut inner = self.inner.borrow_mut();
        let idle_timeout = inner.config.idle_timeout;
        let before = inner.idle.len();
        inner.idle.retain(|entry| entry.idle_since.elapsed() < idle_timeout);
        let dropped = before - inner.idle.len();
        if dropped > 0 {
            debug!(target: "ppool", addr = %self.addr, dropped, "gc dropped idle backend connections");
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.borrow().idle.len()
    }

    pub fn conn_count(&self) -> usize {
        self.inner.borrow().conn_count.get()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.borrow().config.max_connections
    }
}

/// slot a response body releases its transport back into.
pub(crate) struct PoolSlot {
    inner: Rc<RefCell<PoolInner>>,
    ticket: ConnTicket,
}

impl PoolSlot {
    pub(crate) fn release(self, conn: H1Connection) {
        let mut inner = self.inner.borrow_mut();
        inner.idle.push_back(IdleConn {
            conn,
            ticket: self.ticket,
            idle_since: Instant::now(),
        });
    }
}

/// one borrowed backend connection, fresh or reused.
pub struct PooledConnection {
    conn: H1Connection,
    ticket: ConnTicket,
    inner: Rc<RefCell<PoolInner>>,
    config: PoolConfig,
    reused: bool,
}

impl PooledConnection {
    /// true when this transport already served requests.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn request_count(&self) -> usize {
        self.conn.request_count()
    }

    /// run one exchange. on success the response body owns the transport and
    /// returns it to the pool once drained, when reuse is still allowed.
    pub async fn send<B, E>(mut self, parts: request::Parts, body: B) -> Result<Response<ResponseBody>, SendError<B>>
    where
        B: Stream<Item = Result<Bytes, E>>,
        E: Into<BodyError>,
    {
        let opts = SendOptions {
            continue_timeout: self.config.continue_timeout,
            response_timeout: self.config.response_timeout,
            monitor_chunked: self.config.monitor_chunked,
        };

        let exchange = h1::send(&mut self.conn, parts, body, opts).await?;

        self.conn.request_count += 1;

        let reusable = exchange.reusable && self.conn.request_count < self.config.max_requests_per_conn;

        let slot = PoolSlot {
            inner: self.inner,
            ticket: self.ticket,
        };

        let (parts, _) = exchange.head.response.into_parts();
        let body = ResponseBody::new(self.conn, exchange.head.decoder, slot, reusable, self.config.read_timeout);

        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use strand_http::body::NoneBody;
    use strand_http::http::Request;

    use super::*;

    async fn next_chunk(body: &mut ResponseBody) -> Option<std::io::Result<Bytes>> {
        core::future::poll_fn(|cx| core::pin::Pin::new(&mut *body).poll_next(cx)).await
    }

    // canned backend serving the same response to every request on one
    // connection.
    async fn backend(listener: tokio::net::TcpListener, response: &'static [u8]) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            let mut total = Vec::new();
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(_) => return,
                };
                total.extend_from_slice(&buf[..n]);
                if total.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response).await.unwrap();
        }
    }

    fn get(uri: &str) -> request::Parts {
        Request::builder().uri(uri).body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn keep_alive_connection_is_pooled_and_reused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(backend(listener, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"));

        let pool = ConnectionPool::new(addr.to_string(), PoolConfig::default());

        for round in 0..2 {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(conn.is_reused(), round > 0);

            let res = conn
                .send(get("http://x/"), NoneBody::<Bytes>::default())
                .await
                .map_err(|e| e.error)
                .unwrap();
            assert_eq!(res.status(), 200);

            let mut body = res.into_body();
            let mut out = Vec::new();
            while let Some(chunk) = next_chunk(&mut body).await {
                out.extend_from_slice(&chunk.unwrap());
            }
            assert_eq!(out, b"hi");
            assert_eq!(pool.conn_count(), 1);
            assert_eq!(pool.idle_count(), 1);
        }
    }

    #[tokio::test]
    async fn close_response_drops_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(backend(
            listener,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi",
        ));

        let pool = ConnectionPool::new(addr.to_string(), PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        let res = conn
            .send(get("http://x/"), NoneBody::<Bytes>::default())
            .await
            .map_err(|e| e.error)
            .unwrap();

        let mut body = res.into_body();
        while let Some(chunk) = next_chunk(&mut body).await {
            chunk.unwrap();
        }

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.conn_count(), 0);
    }

    #[tokio::test]
    async fn connect_failure_releases_slot() {
        // a bound then dropped listener leaves a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = ConnectionPool::new(addr.to_string(), PoolConfig::default());

        match pool.acquire().await {
            Err(Error::Connect(_)) => {}
            res => panic!("unexpected acquire outcome: {:?}", res.is_ok()),
        }
        assert_eq!(pool.conn_count(), 0, "failed dial must release its slot");
    }

    #[tokio::test]
    async fn pool_exhaustion_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = PoolConfig::default();
        config.max_connections = 1;
        let pool = ConnectionPool::new(addr.to_string(), config);

        let _held = pool.acquire().await.unwrap();
        match pool.acquire().await {
            Err(Error::PoolExhausted) => {}
            res => panic!("unexpected acquire outcome: {:?}", res.is_ok()),
        }
    }

    #[test]
    fn time_delta_mean_over_window() {
        let pool = ConnectionPool::new("127.0.0.1:1", PoolConfig::default());
        assert_eq!(pool.time_delta(), 0);

        pool.report_time_delta(10);
        pool.report_time_delta(20);
        assert_eq!(pool.time_delta(), 15);

        // window overflow keeps only the most recent samples.
        for _ in 0..TIME_DELTA_SAMPLES {
            pool.report_time_delta(4);
        }
        assert_eq!(pool.time_delta(), 4);
    }
}
