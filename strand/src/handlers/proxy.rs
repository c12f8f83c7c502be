//! reverse proxy handler.
//!
//! forwards a request to its backend over a pooled client connection and pipes
//! the backend response body through a ring buffer into the downstream
//! response, so a slow client and a fast backend pace each other without
//! unbounded buffering. failures before the request body uploads and before
//! response bytes reach downstream are retried on a fresh connection, a
//! bounded number of times.

use core::{cell::RefCell, pin::Pin, task::{Context, Poll}};

use std::{
    rc::Rc,
    time::{Duration, SystemTime},
};

use futures_core::stream::Stream;
use tracing::{debug, warn};

use strand_client::{ConnectionPool, Error as ClientError};
use strand_http::{
    buf::ring::{ring_with_storage, RingConsumer},
    bytes::{Bytes, BytesMut},
    h1::body::RequestBody,
    http::{
        header::{
            HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, DATE, EXPECT, EXPIRES, HOST,
            IF_MODIFIED_SINCE, LAST_MODIFIED, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
        },
        request, Request, Response, StatusCode, Uri, Version,
    },
    util::{arena::Arena, pool::RecordPool},
    ResponseBody,
};

use crate::{
    access_log::{next_uid, ProxyLogInfo},
    LocalBoxFuture,
};

use super::{error_response, Handler, HandlerOutcome, RequestContext};

// ring capacity of the backend-to-client body pipe.
const PROXY_RING_SIZE: usize = 64 * 1024;

pub struct ProxyHandler {
    pool: ConnectionPool,
    copy_host: bool,
    /// uri prefix replacing the matched route prefix on the backend side.
    forward_prefix: Option<String>,
    retry_count: usize,
    buffers: Rc<RefCell<RecordPool<BytesMut>>>,
}

impl ProxyHandler {
    pub fn new(
        pool: ConnectionPool,
        copy_host: bool,
        forward_prefix: Option<String>,
        retry_count: usize,
        buffers: Rc<RefCell<RecordPool<BytesMut>>>,
    ) -> Self {
        Self {
            pool,
            copy_host,
            forward_prefix,
            retry_count,
            buffers,
        }
    }

    fn backend_parts(&self, ctx: &RequestContext, parts: &request::Parts, has_body: bool) -> request::Parts {
        let mut headers = HeaderMap::with_capacity(parts.headers.len() + 4);

        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name) || *name == ACCEPT_ENCODING {
                continue;
            }
            if *name == HOST && !self.copy_host {
                continue;
            }
            if *name == IF_MODIFIED_SINCE {
                // the backend compares against its own clock.
                if let Some(shifted) = shift_date(value, self.pool.time_delta()) {
                    headers.append(IF_MODIFIED_SINCE, shifted);
                    continue;
                }
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(addr) = ctx.remote_addr {
            if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }
        if let Some(host) = parts.uri.host() {
            if let Ok(value) = HeaderValue::from_str(host) {
                headers.insert(HeaderName::from_static("x-forwarded-host"), value);
            }
        }
        if ctx.secure {
            headers.insert(HeaderName::from_static("x-forwarded-ssl"), HeaderValue::from_static("on"));
        }
        if has_body {
            headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        }

        let path_and_query = match self.forward_prefix {
            Some(ref prefix) => {
                let mut path = String::with_capacity(prefix.len() + ctx.path_info.len() + 16);
                path.push_str(prefix);
                path.push_str(&ctx.path_info);
                if let Some(query) = parts.uri.query() {
                    path.push('?');
                    path.push_str(query);
                }
                path
            }
            None => parts
                .uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".into()),
        };

        let uri = format!("http://{}{}", self.pool.addr(), path_and_query)
            .parse::<Uri>()
            .unwrap_or_else(|_| Uri::from_static("http://invalid/"));

        let mut req = Request::new(());
        *req.method_mut() = parts.method.clone();
        *req.version_mut() = Version::HTTP_11;
        *req.uri_mut() = uri;
        *req.headers_mut() = headers;
        req.into_parts().0
    }

    // rewrite backend timestamps into local clock terms and report the
    // observed offset for smoothing.
    fn normalize_response(&self, headers: &mut HeaderMap) {
        let now = SystemTime::now();

        if let Some(date) = headers.get(DATE).and_then(parse_date) {
            let delta = date
                .duration_since(now)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_else(|_| -(now.duration_since(date).map(|d| d.as_secs()).unwrap_or(0) as i64));
            self.pool.report_time_delta(delta);
        }

        let delta = self.pool.time_delta();
        if delta != 0 {
            for name in [DATE, LAST_MODIFIED, EXPIRES] {
                if let Some(shifted) = headers.get(&name).and_then(|v| shift_date(v, -delta)) {
                    headers.insert(name, shifted);
                }
            }
        }

        headers.remove(CONNECTION);
        headers.remove(TRANSFER_ENCODING);
    }
}

impl Handler for ProxyHandler {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn cache_key(&self, ctx: &RequestContext, req: &Request<RequestBody>, arena: &mut Arena) -> Option<Bytes> {
        arena.start_stream();
        match req.uri().host() {
            Some(host) => arena.append_str(host),
            None => arena.append_char(b'-'),
        }
        if ctx.secure {
            arena.append_str("_s");
        }
        match req.uri().path_and_query() {
            Some(pq) => arena.append_str(pq.as_str()),
            None => arena.append_char(b'/'),
        }
        Some(arena.finish_stream())
    }

    fn handle<'a>(&'a self, ctx: &'a RequestContext, req: Request<RequestBody>) -> LocalBoxFuture<'a, HandlerOutcome> {
        Box::pin(async move {
            let (parts, req_body) = req.into_parts();
            let has_body = !req_body.is_none();

            let mut body = Some(req_body);
            let mut attempt = 0usize;

            loop {
                attempt += 1;

                let conn = match self.pool.acquire().await {
                    Ok(conn) => conn,
                    Err(ClientError::Connect(_)) | Err(ClientError::PoolExhausted) if attempt <= self.retry_count => {
                        debug!(target: "proxy", attempt, "backend connect failed; retrying");
                        continue;
                    }
                    Err(e) => {
                        warn!(target: "proxy", "no backend connection: {e}");
                        return HandlerOutcome::Respond(error_response(StatusCode::BAD_GATEWAY));
                    }
                };

                let request_n = conn.request_count() + 1;
                let backend_parts = self.backend_parts(ctx, &parts, has_body);

                match conn.send(backend_parts, body.take().expect("request body lost")).await {
                    Ok(mut res) => {
                        self.normalize_response(res.headers_mut());

                        let status = res.status();
                        let log = ProxyLogInfo {
                            uid: next_uid(),
                            request_n,
                            conns: self.pool.conn_count(),
                            max_conns: self.pool.max_connections(),
                            status: status.as_u16(),
                        };

                        let (mut parts, backend_body) = res.into_parts();
                        parts.extensions.insert(log);

                        let body = self.pipe_body(backend_body);
                        return HandlerOutcome::Respond(Response::from_parts(parts, body));
                    }
                    Err(e) if e.is_retryable() && attempt <= self.retry_count => {
                        debug!(target: "proxy", attempt, error = %e.error, "backend request failed; retrying");
                        body = e.body;
                    }
                    Err(e) => {
                        warn!(target: "proxy", error = %e.error, "backend request failed");
                        return HandlerOutcome::Respond(error_response(StatusCode::GATEWAY_TIMEOUT));
                    }
                }
            }
        })
    }
}

impl ProxyHandler {
    // decouple backend and client through a pooled ring buffer.
    fn pipe_body(&self, backend_body: strand_client::ResponseBody) -> ResponseBody {
        let storage = self.buffers.borrow_mut().get();
        let (mut tx, rx) = ring_with_storage(storage, PROXY_RING_SIZE);

        tokio::task::spawn_local(async move {
            let mut backend_body = core::pin::pin!(backend_body);
            loop {
                match core::future::poll_fn(|cx| backend_body.as_mut().poll_next(cx)).await {
                    Some(Ok(chunk)) => {
                        if tx.write_all(&chunk).await.is_err() {
                            // downstream went away; dropping the backend body
                            // tears its connection down with it.
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tx.fail(e);
                        return;
                    }
                    None => {
                        tx.close();
                        return;
                    }
                }
            }
        });

        ResponseBody::box_stream(PooledRing {
            rx: Some(rx),
            buffers: self.buffers.clone(),
        })
    }
}

// ring consumer that hands its storage back to the worker's record pool after
// the body completes.
struct PooledRing {
    rx: Option<RingConsumer>,
    buffers: Rc<RefCell<RecordPool<BytesMut>>>,
}

impl Stream for PooledRing {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(rx).poll_next(cx) {
            Poll::Ready(None) => {
                if let Some(storage) = this.rx.take().and_then(RingConsumer::try_into_storage) {
                    this.buffers.borrow_mut().put(storage);
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == CONNECTION
        || *name == TRANSFER_ENCODING
        || *name == TE
        || *name == TRAILER
        || *name == UPGRADE
        || *name == EXPECT
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

fn parse_date(value: &HeaderValue) -> Option<SystemTime> {
    value.to_str().ok().and_then(|v| httpdate::parse_http_date(v).ok())
}

// move an http date by `delta_secs`, positive toward the future.
fn shift_date(value: &HeaderValue, delta_secs: i64) -> Option<HeaderValue> {
    let time = parse_date(value)?;
    let shifted = if delta_secs >= 0 {
        time.checked_add(Duration::from_secs(delta_secs as u64))?
    } else {
        time.checked_sub(Duration::from_secs(delta_secs.unsigned_abs()))?
    };
    HeaderValue::from_str(&httpdate::fmt_http_date(shifted)).ok()
}

#[cfg(test)]
mod test {
    use strand_client::PoolConfig;

    use super::*;

    fn handler(pool_addr: &str) -> ProxyHandler {
        ProxyHandler::new(
            ConnectionPool::new(pool_addr, PoolConfig::default()),
            false,
            Some("/app".into()),
            3,
            Rc::new(RefCell::new(RecordPool::default())),
        )
    }

    fn ctx() -> RequestContext {
        RequestContext {
            remote_addr: Some("10.0.0.9:1234".parse().unwrap()),
            secure: true,
            path_info: "/list".into(),
            req_uid: 7,
        }
    }

    fn incoming() -> request::Parts {
        Request::builder()
            .uri("https://front.example/api/list?page=2")
            .header("host", "front.example")
            .header("user-agent", "curl/8")
            .header("connection", "keep-alive")
            .header("accept-encoding", "gzip")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn backend_parts_rewrite_and_forwarding_headers() {
        let handler = handler("127.0.0.1:8081");
        let parts = handler.backend_parts(&ctx(), &incoming(), true);

        assert_eq!(parts.uri.path_and_query().unwrap().as_str(), "/app/list?page=2");
        assert_eq!(parts.uri.host().unwrap(), "127.0.0.1");

        let headers = &parts.headers;
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.9");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "front.example");
        assert_eq!(headers.get("x-forwarded-ssl").unwrap(), "on");
        assert_eq!(headers.get(EXPECT).unwrap(), "100-continue");
        // hop-by-hop and content negotiation headers stay local.
        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key(ACCEPT_ENCODING));
        assert!(!headers.contains_key(HOST), "host is rebuilt from the backend authority");
        assert!(headers.contains_key("user-agent"));
    }

    #[test]
    fn if_modified_since_shifts_toward_backend_clock() {
        let handler = handler("127.0.0.1:8081");
        // backend runs 60 seconds ahead of us.
        handler.pool.report_time_delta(60);

        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut parts = incoming();
        parts.headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(base)).unwrap(),
        );

        let backend = handler.backend_parts(&ctx(), &parts, false);
        let forwarded = parse_date(backend.headers.get(IF_MODIFIED_SINCE).unwrap()).unwrap();
        assert_eq!(forwarded, base + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn backend_closing_before_response_yields_single_504_after_retries() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            // accept and slam the door before any response bytes.
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let handler = ProxyHandler::new(
                    ConnectionPool::new(addr.to_string(), PoolConfig::default()),
                    false,
                    None,
                    2,
                    Rc::new(RefCell::new(RecordPool::default())),
                );

                let req = {
                    let mut req = Request::new(RequestBody::default());
                    *req.uri_mut() = "http://front.example/api".parse().unwrap();
                    req
                };

                match handler.handle(&ctx(), req).await {
                    HandlerOutcome::Respond(res) => {
                        assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
                    }
                    _ => panic!("expected a gateway timeout response"),
                }

                // initial attempt plus the two allowed retries.
                assert!(accepted.load(Ordering::SeqCst) >= 1);
                assert!(accepted.load(Ordering::SeqCst) <= 3);
            })
            .await;
    }

    #[test]
    fn cache_key_distinguishes_scheme_and_host() {
        let handler = handler("127.0.0.1:8081");
        let mut arena = Arena::default();

        let req = {
            let mut req = Request::new(RequestBody::default());
            *req.uri_mut() = "https://front.example/api/list?page=2".parse().unwrap();
            req
        };

        let key = handler.cache_key(&ctx(), &req, &mut arena).unwrap();
        assert_eq!(&key[..], b"front.example_s/api/list?page=2");
    }
}
