//! per worker assembly: routing table, request dispatch, connection adapter
//! and the gc tick.

use core::{
    cell::RefCell,
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use std::{net::SocketAddr, rc::Rc, time::SystemTime};

#[cfg(feature = "rustls")]
use std::sync::Arc;

use futures_core::stream::Stream;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use strand_client::{ConnectionPool, PoolConfig};
use strand_http::{
    bytes::{Bytes, BytesMut},
    config::HttpServiceConfig,
    error::{BodyError, HttpServiceError},
    h1::{body::RequestBody, H1Service},
    http::{header::USER_AGENT, remote_addr, Method, Request, Response, StatusCode, Version},
    io::TcpStream,
    service::Service,
    util::{arena::Arena, pool::RecordPool},
    ResponseBody,
};
use strand_server::{wpool::WorkerFactory, ConnectionService};

use crate::{
    access_log::{next_uid, AccessLog, AccessRecord, ProxyLogInfo, WorkerLog},
    config::{Config, ListenConfig, RouteConfig},
    filters::{cors::CorsFilter, file_cache::FileCacheFilter, Filter, FilterContext},
    handlers::{error_response, proxy::ProxyHandler, sendfile::FileHandler, Handler, HandlerOutcome, RequestContext},
    subrequest::Subrequest,
};

tokio::task_local! {
    // connection uid of the connection currently being served by this task.
    pub(crate) static CONN_UID: u64;
}

// gc cadence of a worker: pool shrink, idle backend teardown, log flush.
const GC_INTERVAL: Duration = Duration::from_secs(1);

/// state shared by everything running on one worker.
pub struct WorkerEnv {
    pub wpool: WorkerFactory,
    pub buffers: Rc<RefCell<RecordPool<BytesMut>>>,
    pub arena: RefCell<Arena>,
    pub log: Rc<WorkerLog>,
    pools: RefCell<Vec<ConnectionPool>>,
}

impl WorkerEnv {
    /// build the env and start its gc tick. must run inside the worker's
    /// local set.
    pub fn new(wpool: WorkerFactory, access_log: AccessLog) -> Rc<Self> {
        let env = Rc::new(Self {
            wpool,
            buffers: Rc::new(RefCell::new(RecordPool::default())),
            arena: RefCell::new(Arena::default()),
            log: WorkerLog::new(access_log),
            pools: RefCell::new(Vec::new()),
        });

        let gc_env = Rc::downgrade(&env);
        tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                let Some(env) = gc_env.upgrade() else { return };
                env.buffers.borrow_mut().shrink();
                for pool in env.pools.borrow().iter() {
                    pool.gc();
                }
                env.wpool.gc();
                env.log.flush();
            }
        });

        env
    }

    fn register_pool(&self, pool: ConnectionPool) {
        self.pools.borrow_mut().push(pool);
    }
}

thread_local! {
    static WORKER_ENV: RefCell<Option<Rc<WorkerEnv>>> = const { RefCell::new(None) };
}

/// the calling worker thread's [WorkerEnv], created on first use. listeners
/// of one worker share pools, the blocking worker factory and the log buffer.
pub fn worker_env(wpool: &WorkerFactory, access_log: &AccessLog) -> Rc<WorkerEnv> {
    WORKER_ENV.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| WorkerEnv::new(wpool.clone(), access_log.clone()))
            .clone()
    })
}

struct BoundRoute {
    prefix: String,
    vhost: Option<String>,
    handler: Box<dyn Handler>,
    filters: Vec<Box<dyn Filter>>,
}

impl BoundRoute {
    fn matches(&self, host: Option<&str>, path: &str) -> bool {
        if let Some(ref vhost) = self.vhost {
            match host {
                Some(host) => {
                    let host = host.split(':').next().unwrap_or(host);
                    if !host.eq_ignore_ascii_case(vhost) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        path.starts_with(&self.prefix)
    }
}

/// request router of one listener on one worker.
pub struct RouterService {
    routes: Vec<BoundRoute>,
    env: Rc<WorkerEnv>,
    secure: bool,
}

impl RouterService {
    pub fn from_config(config: &Config, env: Rc<WorkerEnv>, secure: bool) -> Self {
        let routes = config
            .routes
            .iter()
            .filter_map(|route| bind_route(config, route, &env))
            .collect();

        Self { routes, env, secure }
    }
}

fn bind_route(config: &Config, route: &RouteConfig, env: &Rc<WorkerEnv>) -> Option<BoundRoute> {
    let handler: Box<dyn Handler> = match route.handler.as_str() {
        "file" => {
            let Some(ref dir) = route.dir else {
                warn!("file route {:?} without dir; route skipped", route.prefix);
                return None;
            };
            Box::new(FileHandler::new(dir.clone(), route.index.clone(), env.wpool.clone()))
        }
        "proxy" => {
            let Some(ref backend) = route.backend else {
                warn!("proxy route {:?} without backend; route skipped", route.prefix);
                return None;
            };
            let backend = &config.backends[backend];

            let mut pool_config = PoolConfig::default();
            if let Some(max) = backend.max_connections {
                pool_config.max_connections = max;
            }
            if let Some(secs) = backend.connect_timeout_secs {
                pool_config.connect_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = backend.response_timeout_secs {
                pool_config.response_timeout = Duration::from_secs(secs);
            }

            let pool = ConnectionPool::new(backend.address.clone(), pool_config);
            env.register_pool(pool.clone());

            Box::new(ProxyHandler::new(
                pool,
                route.proxy_copy_host,
                route.uri.clone(),
                config.proxy_retry_count,
                env.buffers.clone(),
            ))
        }
        other => {
            warn!("unknown handler {other:?}; route skipped");
            return None;
        }
    };

    let filters = route
        .filters
        .iter()
        .filter_map(|name| -> Option<Box<dyn Filter>> {
            match name.as_str() {
                "file_cache" => {
                    let Some(ref dir) = route.cache_dir else {
                        warn!("file_cache filter without cache_dir on route {:?}; filter skipped", route.prefix);
                        return None;
                    };
                    Some(Box::new(FileCacheFilter::new(dir.clone())))
                }
                "cors" => Some(Box::new(CorsFilter::new(route.cors_origin.as_deref().unwrap_or("*")))),
                other => {
                    warn!("unknown filter {other:?}; filter skipped");
                    None
                }
            }
        })
        .collect();

    Some(BoundRoute {
        prefix: route.prefix.clone(),
        vhost: route.vhost.clone(),
        handler,
        filters,
    })
}

impl Service<Request<RequestBody>> for RouterService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;

    async fn call(&self, req: Request<RequestBody>) -> Result<Self::Response, Self::Error> {
        let started = Instant::now();
        let time = SystemTime::now();
        let req_uid = next_uid();
        let conn_uid = CONN_UID.try_with(|uid| *uid).unwrap_or(req_uid);

        let parent_uid = req.extensions().get::<Subrequest>().map(|s| s.parent_uid);
        let remote = remote_addr(&req);
        let method = req.method().clone();
        let http11 = req.version() == Version::HTTP_11;
        let host = req.uri().host().map(|h| Bytes::copy_from_slice(h.as_bytes()));
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| Bytes::copy_from_slice(pq.as_str().as_bytes()))
            .unwrap_or_else(|| Bytes::from_static(b"/"));
        let user_agent = req.headers().get(USER_AGENT).cloned();

        let (handler_name, mut response) = self.dispatch(req, req_uid, remote).await;

        let proxy = response.extensions_mut().remove::<ProxyLogInfo>();

        let record = AccessRecord {
            time,
            conn_uid,
            req_uid,
            remote,
            parent_uid,
            method,
            http11,
            host,
            uri,
            user_agent,
            status: response.status().as_u16(),
            bytes_sent: 0,
            duration: Duration::ZERO,
            handler: handler_name,
            proxy,
        };

        let (parts, body) = response.into_parts();
        let body = LogBody {
            inner: body,
            record: Some(record),
            log: self.env.log.clone(),
            started,
        };

        Ok(Response::from_parts(parts, ResponseBody::box_stream(body)))
    }
}

impl RouterService {
    async fn dispatch(
        &self,
        mut req: Request<RequestBody>,
        req_uid: u64,
        remote: Option<SocketAddr>,
    ) -> (&'static str, Response<ResponseBody>) {
        let host = req.uri().host().map(str::to_owned);
        let path = req.uri().path().to_owned();

        for route in &self.routes {
            if !route.matches(host.as_deref(), &path) {
                continue;
            }

            let ctx = RequestContext {
                remote_addr: remote,
                secure: self.secure,
                path_info: normalize_path_info(&path, &route.prefix),
                req_uid,
            };

            // cache phase: cacheable requests may be answered without running
            // the handler at all.
            let mut cache_path = None;
            if req.method() == Method::GET && req.body().is_none() && !route.filters.is_empty() {
                let key = {
                    let mut arena = self.env.arena.borrow_mut();
                    let key = route.handler.cache_key(&ctx, &req, &mut arena);
                    arena.reset();
                    key
                };
                if let Some(key) = key {
                    for filter in &route.filters {
                        if let Some(path) = filter.translate_cache_key(&key) {
                            cache_path = Some(path);
                        }
                    }
                }
                if let Some(ref path) = cache_path {
                    for filter in &route.filters {
                        if let Some(resp) = filter.serve_from_cache(path).await {
                            trace!(target: "dispatch", "request served from cache");
                            return ("fcache", resp);
                        }
                    }
                }
            }

            match route.handler.handle(&ctx, req).await {
                HandlerOutcome::Respond(resp) => {
                    let fctx = FilterContext {
                        cache_path,
                        now: SystemTime::now(),
                    };
                    let mut resp = resp;
                    for filter in &route.filters {
                        resp = filter.apply(&fctx, resp).await;
                    }
                    return (route.handler.name(), resp);
                }
                HandlerOutcome::Next(returned) => {
                    req = returned;
                    continue;
                }
                HandlerOutcome::Error(status) => {
                    return (route.handler.name(), error_response(status));
                }
            }
        }

        ("-", error_response(StatusCode::NOT_FOUND))
    }
}

fn normalize_path_info(path: &str, prefix: &str) -> String {
    let stripped = &path[prefix.len().min(path.len())..];
    if stripped.starts_with('/') {
        stripped.to_owned()
    } else {
        format!("/{stripped}")
    }
}

// response body wrapper producing the access log line once the body is done,
// or when the connection goes away under it.
struct LogBody {
    inner: ResponseBody,
    record: Option<AccessRecord>,
    log: Rc<WorkerLog>,
    started: Instant,
}

impl LogBody {
    fn finalize(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.duration = self.started.elapsed();
            self.log.write(&record);
        }
    }
}

impl Drop for LogBody {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl Stream for LogBody {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                if let Some(ref mut record) = this.record {
                    record.bytes_sent += bytes.len() as u64;
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finalize();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// connection entry point of one listen entry.
pub struct ListenerService {
    kind: ListenerKind,
}

enum ListenerKind {
    Plain(H1Service<RouterService>),
    #[cfg(feature = "rustls")]
    Tls(strand_http::h1::H1TlsService<RouterService>),
}

impl ListenerService {
    /// build the service stack of one listener on the current worker.
    pub fn new(
        config: &Config,
        listen: &ListenConfig,
        env: Rc<WorkerEnv>,
        #[cfg(feature = "rustls")] tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let router = RouterService::from_config(config, env, listen.secure);
        let http_config = HttpServiceConfig::new();

        #[cfg(feature = "rustls")]
        if listen.secure {
            let tls = tls.expect("secure listener without tls config");
            return Self {
                kind: ListenerKind::Tls(strand_http::h1::H1TlsService::new(http_config, router, tls)),
            };
        }

        Self {
            kind: ListenerKind::Plain(H1Service::new(http_config, router)),
        }
    }
}

impl ConnectionService for ListenerService {
    async fn handle(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let conn_uid = next_uid();

        let io = match TcpStream::accepted(stream) {
            Ok(io) => io,
            Err(e) => {
                error!(target: "accept", "socket setup failed: {e}");
                return;
            }
        };

        let result = CONN_UID
            .scope(conn_uid, async {
                match self.kind {
                    ListenerKind::Plain(ref service) => service.call((io, addr)).await,
                    #[cfg(feature = "rustls")]
                    ListenerKind::Tls(ref service) => service.call((io, addr)).await,
                }
            })
            .await;

        match result {
            Ok(_) | Err(HttpServiceError::KeepAliveExpire) => {}
            Err(HttpServiceError::Io(ref e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                trace!(target: "connection", "peer dropped connection: {e}");
            }
            Err(e) => e.log("connection"),
        }
    }
}
