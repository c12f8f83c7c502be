//! on-disk response cache.
//!
//! response bytes tee into a temporary cache file while they stream to the
//! client. the temp file is created with `O_EXCL`, so of any number of
//! concurrent misses for one key exactly one populates the cache and the rest
//! bypass. committing the entry (rename into place, mtime set to the intended
//! expiry) is gated on the dispatcher's delivery notice: only once the
//! response's final byte was flushed to the transport does the rename run, and
//! a connection that dies first leaves no entry behind.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use filetime::FileTime;
use futures_core::stream::Stream;
use sha1::{Digest, Sha1};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use strand_http::{
    body::FlushNotice,
    buf::file::{chunk_read, FileSink, DEFAULT_CHUNK_SIZE},
    bytes::Bytes,
    error::BodyError,
    http::{
        header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, EXPIRES, LAST_MODIFIED},
        Response, StatusCode,
    },
    ResponseBody,
};

use crate::LocalBoxFuture;

use super::{Filter, FilterContext};

// cap on one cached response body.
const MAX_CACHE_FILE_SIZE: u64 = 256 * 1024 * 1024;

pub struct FileCacheFilter {
    root: PathBuf,
}

impl FileCacheFilter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

/// virtual key -> `<root>/<aa>/<38 hex tail>`.
fn cache_path(root: &Path, key: &[u8]) -> PathBuf {
    let digest = Sha1::digest(key);

    let mut hex = String::with_capacity(40);
    for byte in digest {
        use core::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }

    root.join(&hex[..2]).join(&hex[2..])
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

// expiry the response asks for: max-age beats an explicit Expires. responses
// without either are not materialized.
fn expiry_of(resp: &Response<ResponseBody>, now: SystemTime) -> Option<SystemTime> {
    if let Some(cc) = resp.headers().get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        for directive in cc.split(',') {
            let directive = directive.trim();
            if matches!(directive, "no-cache" | "no-store" | "private") {
                return None;
            }
            if let Some(age) = directive.strip_prefix("max-age=") {
                let age: u64 = age.parse().ok()?;
                return Some(now + Duration::from_secs(age));
            }
        }
    }

    resp.headers()
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

impl Filter for FileCacheFilter {
    fn name(&self) -> &'static str {
        "file_cache"
    }

    fn translate_cache_key(&self, key: &[u8]) -> Option<PathBuf> {
        Some(cache_path(&self.root, key))
    }

    fn serve_from_cache<'a>(&'a self, path: &'a Path) -> LocalBoxFuture<'a, Option<Response<ResponseBody>>> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(path).await.ok()?;

            // mtime carries the expiry; a stale file is repopulated instead.
            let expires = meta.modified().ok()?;
            if expires <= SystemTime::now() {
                return None;
            }

            let file = tokio::fs::File::open(path).await.ok()?;
            debug!(target: "fcache", "serving {} from cache", path.display());

            let mut res = Response::new(ResponseBody::box_stream(chunk_read(
                file,
                0,
                meta.len(),
                DEFAULT_CHUNK_SIZE,
            )));
            res.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(meta.len()));

            if let Ok(created) = meta.created() {
                if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(created)) {
                    res.headers_mut().insert(LAST_MODIFIED, value);
                }
            }

            Some(res)
        })
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a FilterContext,
        resp: Response<ResponseBody>,
    ) -> LocalBoxFuture<'a, Response<ResponseBody>> {
        Box::pin(async move {
            let Some(ref path) = ctx.cache_path else {
                return resp;
            };

            if resp.status() != StatusCode::OK {
                return resp;
            }

            let Some(expires) = expiry_of(&resp, ctx.now) else {
                return resp;
            };

            let tmp = tmp_path(path);

            if let Some(parent) = tmp.parent() {
                if tokio::fs::create_dir_all(parent).await.is_err() {
                    warn!(target: "fcache", "can't create cache directory {}", parent.display());
                    return resp;
                }
            }

            // exclusive create arbitrates concurrent misses: losing the race
            // means someone else is building this entry.
            let file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    debug!(target: "fcache", "cache entry {} already being built: {e}", tmp.display());
                    return resp;
                }
            };

            let (mut parts, body) = resp.into_parts();

            // the commit is gated on this notice: the dispatcher fires it
            // once the response's last byte was flushed to the socket.
            let (notice, delivered) = FlushNotice::channel();
            parts.extensions.insert(notice);

            let tee = CacheTee {
                inner: body,
                state: TeeState::Idle(FileSink::new(file, MAX_CACHE_FILE_SIZE)),
                tmp,
                dest: path.clone(),
                expires,
                delivered: Some(delivered),
                tmp_live: true,
            };

            Response::from_parts(parts, ResponseBody::box_stream(tee))
        })
    }
}

struct CacheTee {
    inner: ResponseBody,
    state: TeeState,
    tmp: PathBuf,
    dest: PathBuf,
    expires: SystemTime,
    // resolves when the dispatcher flushed the response's final byte.
    delivered: Option<oneshot::Receiver<()>>,
    // temp file still on disk and owned by this tee.
    tmp_live: bool,
}

enum TeeState {
    /// sink ready for the next chunk.
    Idle(FileSink),
    /// cache write in flight; the chunk travels downstream afterwards.
    Writing(LocalBoxFuture<'static, (FileSink, Bytes)>),
    /// cache abandoned; bytes keep flowing downstream.
    Bypass,
    Done,
}

impl Drop for CacheTee {
    fn drop(&mut self) {
        if self.tmp_live {
            // abandoned mid-stream: never leave half entries behind.
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

async fn write_chunk(mut sink: FileSink, chunk: Bytes) -> (FileSink, Bytes) {
    sink.write(&chunk).await;
    (sink, chunk)
}

async fn commit(sink: FileSink, tmp: PathBuf, dest: PathBuf, expires: SystemTime) -> io::Result<()> {
    let file = sink.finish().await?;
    drop(file);

    tokio::fs::rename(&tmp, &dest).await?;

    let stamp = FileTime::from_system_time(expires);
    tokio::task::spawn_blocking(move || filetime::set_file_times(&dest, stamp, stamp))
        .await
        .map_err(io::Error::other)?
}

// runs detached after the body finished: wait for the delivery confirmation,
// then rename the finished temp file into place. an unconfirmed response (the
// connection died before its tail flushed) drops the entry instead.
async fn commit_when_delivered(
    delivered: oneshot::Receiver<()>,
    sink: FileSink,
    tmp: PathBuf,
    dest: PathBuf,
    expires: SystemTime,
) {
    if delivered.await.is_err() {
        debug!(target: "fcache", "response never fully delivered; dropping cache entry {}", tmp.display());
        let _ = tokio::fs::remove_file(&tmp).await;
        return;
    }

    if let Err(e) = commit(sink, tmp.clone(), dest.clone(), expires).await {
        warn!(target: "fcache", "cache commit failed for {}: {e}", dest.display());
        let _ = tokio::fs::remove_file(&tmp).await;
    }
}

impl Stream for CacheTee {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match this.state {
                TeeState::Idle(_) => match Pin::new(&mut this.inner).poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        let TeeState::Idle(sink) = core::mem::replace(&mut this.state, TeeState::Bypass) else {
                            unreachable!()
                        };
                        this.state = TeeState::Writing(Box::pin(write_chunk(sink, chunk)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        this.abandon();
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => {
                        let TeeState::Idle(sink) = core::mem::replace(&mut this.state, TeeState::Done) else {
                            unreachable!()
                        };
                        let delivered = this.delivered.take().expect("tee reached eof twice");

                        // all bytes are written to the temp file and handed to
                        // the dispatcher. the detached task owns the entry from
                        // here and commits only on confirmed delivery.
                        this.tmp_live = false;
                        tokio::task::spawn_local(commit_when_delivered(
                            delivered,
                            sink,
                            this.tmp.clone(),
                            this.dest.clone(),
                            this.expires,
                        ));

                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                },

                TeeState::Writing(ref mut fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready((sink, chunk)) => {
                        if sink.error().is_some() {
                            warn!(target: "fcache", "cache write failed for {}; bypassing", this.tmp.display());
                            this.abandon();
                        } else {
                            this.state = TeeState::Idle(sink);
                        }
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Poll::Pending => return Poll::Pending,
                },

                TeeState::Bypass => return Pin::new(&mut this.inner).poll_next(cx),

                TeeState::Done => return Poll::Ready(None),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl CacheTee {
    fn abandon(&mut self) {
        if self.tmp_live {
            let _ = std::fs::remove_file(&self.tmp);
            self.tmp_live = false;
        }
        self.state = TeeState::Bypass;
    }
}

#[cfg(test)]
mod test {
    use core::future::poll_fn;

    use tokio::task::LocalSet;

    use strand_http::http::response;

    use super::*;

    fn cached_response(body: &'static [u8]) -> Response<ResponseBody> {
        let mut res = Response::new(ResponseBody::bytes(body));
        res.headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        res
    }

    async fn drain_body(mut body: ResponseBody) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = poll_fn(|cx| Pin::new(&mut body).poll_next(cx)).await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    // drain the body, then report delivery the way the dispatcher does after
    // its final flush. returns the body bytes.
    async fn drain_and_deliver(resp: Response<ResponseBody>) -> (response::Parts, Vec<u8>) {
        let (parts, body) = resp.into_parts();
        let out = drain_body(body).await;
        if let Some(notice) = parts.extensions.get::<FlushNotice>() {
            notice.notify();
        }
        (parts, out)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn ctx_for(path: PathBuf) -> FilterContext {
        FilterContext {
            cache_path: Some(path),
            now: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn miss_populates_cache_after_delivery() {
        let root = tempfile::tempdir().unwrap();
        let filter = FileCacheFilter::new(root.path().into());

        let path = filter.translate_cache_key(b"example.com/page").unwrap();
        let ctx = ctx_for(path.clone());

        LocalSet::new()
            .run_until(async {
                let resp = filter.apply(&ctx, cached_response(b"cached body")).await;
                let (parts, body) = resp.into_parts();
                let notice = parts.extensions.get::<FlushNotice>().cloned().expect("tee attaches a notice");

                assert_eq!(drain_body(body).await, b"cached body");

                // body done but delivery unconfirmed: the temp entry is built,
                // nothing is committed yet.
                tokio::task::yield_now().await;
                assert!(tmp_path(&path).exists());
                assert!(!path.exists());

                notice.notify();
                wait_until(|| path.exists() && !tmp_path(&path).exists()).await;

                assert_eq!(std::fs::read(&path).unwrap(), b"cached body");

                // mtime records the expiry, roughly a minute out.
                let expires = std::fs::metadata(&path).unwrap().modified().unwrap();
                assert!(expires > SystemTime::now() + Duration::from_secs(30));
            })
            .await;
    }

    #[tokio::test]
    async fn undelivered_response_commits_nothing() {
        let root = tempfile::tempdir().unwrap();
        let filter = FileCacheFilter::new(root.path().into());

        let path = filter.translate_cache_key(b"undelivered/key").unwrap();
        let ctx = ctx_for(path.clone());

        LocalSet::new()
            .run_until(async {
                let resp = filter.apply(&ctx, cached_response(b"lost on the wire")).await;
                let (parts, body) = resp.into_parts();

                assert_eq!(drain_body(body).await, b"lost on the wire");

                // connection dies: the notice drops without firing.
                drop(parts);

                wait_until(|| !tmp_path(&path).exists()).await;
                assert!(!path.exists());
            })
            .await;
    }

    #[tokio::test]
    async fn concurrent_miss_single_materialization() {
        let root = tempfile::tempdir().unwrap();
        let filter = FileCacheFilter::new(root.path().into());

        let path = filter.translate_cache_key(b"race/key").unwrap();
        let ctx = ctx_for(path.clone());

        LocalSet::new()
            .run_until(async {
                // both responses get their body through; only one builds the
                // entry, the other loses the O_EXCL race and bypasses.
                let a = filter.apply(&ctx, cached_response(b"payload")).await;
                let b = filter.apply(&ctx, cached_response(b"payload")).await;

                let (_b_parts, b_out) = drain_and_deliver(b).await;
                assert_eq!(b_out, b"payload");

                let (_a_parts, a_out) = drain_and_deliver(a).await;
                assert_eq!(a_out, b"payload");

                wait_until(|| path.exists() && !tmp_path(&path).exists()).await;
                assert_eq!(std::fs::read(&path).unwrap(), b"payload");
            })
            .await;
    }

    #[tokio::test]
    async fn fresh_entry_serves_and_stale_repopulates() {
        let root = tempfile::tempdir().unwrap();
        let filter = FileCacheFilter::new(root.path().into());

        let path = filter.translate_cache_key(b"serve/key").unwrap();
        let ctx = ctx_for(path.clone());

        LocalSet::new()
            .run_until(async {
                let resp = filter.apply(&ctx, cached_response(b"fresh bytes")).await;
                drain_and_deliver(resp).await;
                wait_until(|| path.exists()).await;

                let served = filter.serve_from_cache(&path).await.expect("fresh entry must serve");
                assert_eq!(drain_body(served.into_body()).await, b"fresh bytes");

                // age the entry past its expiry; it stops serving.
                let past = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(10));
                filetime::set_file_times(&path, past, past).unwrap();
                assert!(filter.serve_from_cache(&path).await.is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn responses_without_expiry_are_not_cached() {
        let root = tempfile::tempdir().unwrap();
        let filter = FileCacheFilter::new(root.path().into());

        let path = filter.translate_cache_key(b"nocache/key").unwrap();
        let ctx = ctx_for(path.clone());

        LocalSet::new()
            .run_until(async {
                let resp = filter.apply(&ctx, Response::new(ResponseBody::bytes("plain"))).await;
                let (parts, out) = drain_and_deliver(resp).await;
                assert_eq!(out, b"plain");
                assert!(parts.extensions.get::<FlushNotice>().is_none(), "bypassed response carries no notice");
                assert!(!path.exists());

                let mut resp = Response::new(ResponseBody::bytes("private"));
                resp.headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("private, max-age=60"));
                let resp = filter.apply(&ctx, resp).await;
                let (_, out) = drain_and_deliver(resp).await;
                assert_eq!(out, b"private");
                assert!(!path.exists());
            })
            .await;
    }

    #[tokio::test]
    async fn abandoned_stream_leaves_no_tmp_behind() {
        let root = tempfile::tempdir().unwrap();
        let filter = FileCacheFilter::new(root.path().into());

        let path = filter.translate_cache_key(b"abort/key").unwrap();
        let ctx = ctx_for(path.clone());

        LocalSet::new()
            .run_until(async {
                let resp = filter.apply(&ctx, cached_response(b"to be dropped")).await;
                // client went away before the body streamed.
                drop(resp);

                assert!(!tmp_path(&path).exists());
                assert!(!path.exists());
            })
            .await;
    }

    #[test]
    fn cache_path_splits_first_byte() {
        let path = cache_path(Path::new("/cache"), b"some key");
        let rel = path.strip_prefix("/cache").unwrap();
        let parts: Vec<_> = rel.iter().map(|p| p.to_str().unwrap()).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 38);
    }
}
